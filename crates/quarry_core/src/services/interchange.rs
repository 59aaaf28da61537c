//! Connection export and import bundles.
//!
//! A bundle is versioned JSON: `{version, exported_at, connections[]}`.
//! Imports always get fresh identifiers, and names that collide with saved
//! connections (or with earlier entries of the same bundle) become
//! `"name (n)"`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ConnectionConfig, ConnectionOptions, SshAuthMethod, SshTunnelConfig,
};
use crate::services::catalog::ConnectionCatalog;

/// Only bundle version this build reads and writes.
pub const EXPORT_VERSION: u32 = 1;

/// One connection inside a bundle. Identifiers and timestamps are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedConnection {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub ssh_enabled: bool,
    #[serde(default)]
    pub ssh_host: String,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_password: String,
    #[serde(default)]
    pub ssh_key_path: String,
    #[serde(default)]
    pub ssh_use_key: bool,
    /// Absent in older bundles, which only carry `ssh_use_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_auth_method: Option<SshAuthMethod>,
    #[serde(default)]
    pub ssh_key_passphrase: String,
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl From<&ConnectionConfig> for ExportedConnection {
    fn from(config: &ConnectionConfig) -> Self {
        let ssh = config.ssh_tunnel.as_ref();
        Self {
            kind: config.kind,
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone().unwrap_or_default(),
            ssl: config.tls,
            file_path: config.file_path.as_ref().map(|p| p.display().to_string()),
            ssh_enabled: ssh.is_some(),
            ssh_host: ssh.map(|t| t.host.clone()).unwrap_or_default(),
            ssh_port: ssh.map_or(22, |t| t.port),
            ssh_user: ssh.map(|t| t.username.clone()).unwrap_or_default(),
            ssh_password: ssh.and_then(|t| t.password.clone()).unwrap_or_default(),
            ssh_key_path: ssh
                .and_then(|t| t.key_path.as_ref())
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            ssh_use_key: ssh.is_some_and(|t| t.auth_method == SshAuthMethod::Key),
            ssh_auth_method: ssh.map(|t| t.auth_method),
            ssh_key_passphrase: ssh.and_then(|t| t.key_passphrase.clone()).unwrap_or_default(),
            options: config.options.clone(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl ExportedConnection {
    /// Rebuild a descriptor under a new identifier and name.
    fn into_config(self, id: Uuid, name: String) -> ConnectionConfig {
        let auth_method = self.ssh_auth_method.unwrap_or(if self.ssh_use_key {
            SshAuthMethod::Key
        } else {
            SshAuthMethod::Password
        });
        let ssh_tunnel = self.ssh_enabled.then(|| SshTunnelConfig {
            host: self.ssh_host.clone(),
            port: if self.ssh_port == 0 { 22 } else { self.ssh_port },
            username: self.ssh_user.clone(),
            auth_method,
            password: non_empty(&self.ssh_password),
            key_path: non_empty(&self.ssh_key_path).map(PathBuf::from),
            key_passphrase: non_empty(&self.ssh_key_passphrase),
        });

        ConnectionConfig {
            id,
            name,
            kind: self.kind,
            port: if self.port == 0 { self.kind.default_port().unwrap_or(0) } else { self.port },
            host: self.host,
            database: self.database,
            username: self.username,
            password: non_empty(&self.password),
            tls: self.ssl,
            file_path: self.file_path.filter(|p| !p.is_empty()).map(PathBuf::from),
            ssh_tunnel,
            options: self.options,
        }
    }
}

/// Export file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionsExport {
    pub version: u32,
    pub exported_at: String,
    pub connections: Vec<ExportedConnection>,
}

impl ConnectionsExport {
    pub fn new(connections: Vec<ExportedConnection>) -> Self {
        Self { version: EXPORT_VERSION, exported_at: chrono::Utc::now().to_rfc3339(), connections }
    }
}

/// Export the given saved connections, in the order requested.
pub fn export_connections(
    catalog: &dyn ConnectionCatalog,
    ids: &[Uuid],
) -> QuarryResult<ConnectionsExport> {
    let connections = ids
        .iter()
        .map(|id| catalog.require(*id).map(|config| ExportedConnection::from(&config)))
        .collect::<QuarryResult<Vec<_>>>()?;
    tracing::debug!(count = connections.len(), "Connections exported");
    Ok(ConnectionsExport::new(connections))
}

/// First of `name`, `name (1)`, `name (2)`, ... not in `taken`.
fn unique_name(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    (1..)
        .map(|n| format!("{name} ({n})"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| format!("{name} ({})", Uuid::new_v4()))
}

/// Save every connection of `bundle` under a fresh identifier.
///
/// Returns the saved descriptors. Entries that fail validation abort the
/// import before anything is written.
pub fn import_connections(
    catalog: &dyn ConnectionCatalog,
    bundle: ConnectionsExport,
) -> QuarryResult<Vec<ConnectionConfig>> {
    if bundle.version != EXPORT_VERSION {
        return Err(QuarryError::validation(format!(
            "Unsupported export version: {}. Expected version {EXPORT_VERSION}.",
            bundle.version
        )));
    }

    let mut taken: HashSet<String> = catalog.names()?.into_iter().collect();
    let mut configs = Vec::with_capacity(bundle.connections.len());
    for exported in bundle.connections {
        let name = unique_name(&exported.name, &taken);
        taken.insert(name.clone());
        let config = exported.into_config(Uuid::new_v4(), name);
        config.validate().map_err(|e| {
            QuarryError::validation(format!("Invalid connection '{}': {e}", config.name))
        })?;
        configs.push(config);
    }

    for config in &configs {
        catalog.save(config)?;
    }
    tracing::info!(count = configs.len(), "Connections imported");
    Ok(configs)
}
