//! Connection configuration models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Backend family a connection talks to.
///
/// Serialized with the classic driver names so saved catalogs and export
/// bundles stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Relational database with schemas (PostgreSQL)
    #[serde(rename = "postgres", alias = "postgresql")]
    Relational,
    /// Single-file relational database (SQLite)
    #[serde(rename = "sqlite", alias = "sqlite3")]
    FileBased,
    /// Key-value store (Redis)
    #[serde(rename = "redis")]
    KeyValue,
    /// Column store over HTTP (ClickHouse)
    #[serde(rename = "clickhouse")]
    ColumnStore,
}

impl BackendKind {
    /// Parse a driver name as stored by the catalog.
    pub fn from_db_type(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Relational),
            "sqlite" | "sqlite3" => Some(Self::FileBased),
            "redis" => Some(Self::KeyValue),
            "clickhouse" => Some(Self::ColumnStore),
            _ => None,
        }
    }

    /// Driver name used in storage and export bundles.
    pub fn db_type(&self) -> &'static str {
        match self {
            Self::Relational => "postgres",
            Self::FileBased => "sqlite",
            Self::KeyValue => "redis",
            Self::ColumnStore => "clickhouse",
        }
    }

    /// Default TCP port, if the kind is network-based.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Relational => Some(5432),
            Self::FileBased => None,
            Self::KeyValue => Some(6379),
            Self::ColumnStore => Some(8123),
        }
    }

    /// Whether connections of this kind dial a host.
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::FileBased)
    }

    /// Whether structured row edits (INSERT/UPDATE/DELETE) apply.
    pub fn supports_row_edits(&self) -> bool {
        !matches!(self, Self::KeyValue)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.db_type())
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAuthMethod {
    /// Private key authentication, falling back to password when one is set
    Key,
    /// Password authentication
    #[default]
    Password,
    /// SSH agent authentication
    Agent,
}

impl SshAuthMethod {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Password => "password",
            Self::Agent => "agent",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "key" => Self::Key,
            "agent" => Self::Agent,
            _ => Self::Password,
        }
    }
}

/// SSH jump host used to reach the database.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct SshTunnelConfig {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    pub auth_method: SshAuthMethod,
    /// SSH password (password auth, or fallback for key auth)
    #[serde(default)]
    pub password: Option<String>,
    /// Path to private key (required if auth_method = Key)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key
    #[serde(default)]
    pub key_passphrase: Option<String>,
}

impl SshTunnelConfig {
    /// Create a new SSH tunnel configuration.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth_method: SshAuthMethod::Password,
            password: None,
            key_path: None,
            key_passphrase: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set key-based authentication.
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth_method = SshAuthMethod::Key;
        self.key_path = Some(key_path.into());
        self
    }

    /// Set password-based authentication.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        if self.auth_method != SshAuthMethod::Key {
            self.auth_method = SshAuthMethod::Password;
        }
        self.password = Some(password.into());
        self
    }

    /// Use the running SSH agent.
    pub fn with_agent(mut self) -> Self {
        self.auth_method = SshAuthMethod::Agent;
        self
    }

    /// Key path with a leading `~` expanded to the home directory.
    pub fn expanded_key_path(&self) -> Option<PathBuf> {
        let path = self.key_path.as_ref()?;
        let Ok(rest) = path.strip_prefix("~") else {
            return Some(path.clone());
        };
        Some(dirs::home_dir().map(|home| home.join(rest)).unwrap_or_else(|| path.clone()))
    }

    fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("SSH host is required".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("SSH username is required".to_string());
        }
        match self.auth_method {
            SshAuthMethod::Key if self.key_path.is_none() => {
                Err("Key path is required for key-based SSH authentication".to_string())
            }
            SshAuthMethod::Password if self.password.as_deref().unwrap_or("").is_empty() => {
                Err("Password is required for password-based SSH authentication".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for SshTunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTunnelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Additional connection options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Bound for tunnel and adapter dials, in seconds
    pub connect_timeout_secs: u32,
    /// Statement timeout in seconds (PostgreSQL only, None = server default)
    pub statement_timeout_secs: Option<u32>,
    /// Maximum pooled sessions (PostgreSQL only)
    pub pool_max_size: usize,
    /// Application name sent to the server where supported
    pub application_name: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            statement_timeout_secs: None,
            pool_max_size: 4,
            application_name: "Quarry".to_string(),
        }
    }
}

/// Immutable descriptor of a saved connection.
///
/// Never mutated in place by the pool; the catalog replaces it wholesale.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Stable identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Backend kind
    pub kind: BackendKind,
    /// Server hostname or IP (network kinds)
    #[serde(default)]
    pub host: String,
    /// Server port (network kinds)
    #[serde(default)]
    pub port: u16,
    /// Database name, or Redis database index
    #[serde(default)]
    pub database: String,
    /// Login username
    #[serde(default)]
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: Option<String>,
    /// Use TLS to the server
    #[serde(default)]
    pub tls: bool,
    /// Database file (file-based kind)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    /// Optional SSH tunnel settings
    #[serde(default)]
    pub ssh_tunnel: Option<SshTunnelConfig>,
    /// Additional options
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ConnectionConfig {
    /// Create a builder for a connection of the given kind.
    pub fn builder(kind: BackendKind) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(kind)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() || self.name.len() > 255 {
            return Err("Name must be 1-255 characters".to_string());
        }
        if self.kind.is_networked() {
            if self.host.trim().is_empty() {
                return Err("Host is required".to_string());
            }
            if self.port == 0 {
                return Err("Port must be between 1 and 65535".to_string());
            }
        } else if self.file_path.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
            return Err("File path is required for SQLite connections".to_string());
        }
        if let Some(ref tunnel) = self.ssh_tunnel {
            if !self.kind.is_networked() {
                return Err("SSH tunnels are not supported for file-based connections".to_string());
            }
            tunnel.validate()?;
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        match self.kind {
            BackendKind::FileBased => format!(
                "sqlite://{}",
                self.file_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
            ),
            kind => {
                let user = if self.username.is_empty() {
                    String::new()
                } else {
                    format!("{}@", self.username)
                };
                format!(
                    "{}://{}{}:{}/{}",
                    kind.db_type(),
                    user,
                    self.host,
                    self.port,
                    self.database
                )
            }
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .field("file_path", &self.file_path)
            .field("ssh_tunnel", &self.ssh_tunnel)
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for ConnectionConfig.
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    id: Option<Uuid>,
    kind: BackendKind,
    name: Option<String>,
    host: String,
    port: Option<u16>,
    database: String,
    username: String,
    password: Option<String>,
    tls: bool,
    file_path: Option<PathBuf>,
    ssh_tunnel: Option<SshTunnelConfig>,
    options: ConnectionOptions,
}

impl ConnectionConfigBuilder {
    fn new(kind: BackendKind) -> Self {
        Self {
            id: None,
            kind,
            name: None,
            host: String::new(),
            port: None,
            database: String::new(),
            username: String::new(),
            password: None,
            tls: false,
            file_path: None,
            ssh_tunnel: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Use a fixed identifier instead of a fresh one.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the connection name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Enable TLS.
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Set the database file.
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set the SSH tunnel.
    pub fn ssh_tunnel(mut self, tunnel: SshTunnelConfig) -> Self {
        self.ssh_tunnel = Some(tunnel);
        self
    }

    /// Set connection options.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout_secs(mut self, secs: u32) -> Self {
        self.options.connect_timeout_secs = secs;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ConnectionConfig, String> {
        let config = ConnectionConfig {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name.ok_or("Name is required")?,
            kind: self.kind,
            host: self.host,
            port: self.port.or(self.kind.default_port()).unwrap_or(0),
            database: self.database,
            username: self.username,
            password: self.password,
            tls: self.tls,
            file_path: self.file_path,
            ssh_tunnel: self.ssh_tunnel,
            options: self.options,
        };
        config.validate()?;
        Ok(config)
    }
}
