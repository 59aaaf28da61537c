//! Saved-connection catalog.
//!
//! The pool resolves a [`ConnectionConfig`] by identifier through
//! [`ConnectionCatalog`]. [`SqliteCatalog`] is the on-disk store used by the
//! host process; [`MemoryCatalog`] serves tests and embedders.
//!
//! Secrets (database password, SSH password, key passphrase) are never written
//! to the catalog database. They are delegated to a [`SecretStore`].
//!
//! # Data Directory Locations
//!
//! - `QUARRY_DATA_DIR` when set
//! - **Debug builds**: `./quarry_data` in the current directory
//! - **macOS**: `~/Library/Application Support/dev.quarry.Quarry`
//! - **Windows**: `%APPDATA%\quarry\Quarry`
//! - **Linux**: `~/.local/share/quarry`

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ConnectionConfig, ConnectionOptions, SshAuthMethod, SshTunnelConfig,
};
use crate::services::credentials::{SecretKind, SecretStore};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "QUARRY_DATA_DIR";

/// Default data directory for the host process.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    #[cfg(debug_assertions)]
    {
        PathBuf::from("./quarry_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| {
                #[cfg(target_os = "macos")]
                {
                    d.join("dev.quarry.Quarry")
                }
                #[cfg(target_os = "windows")]
                {
                    d.join("quarry").join("Quarry")
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    d.join("quarry")
                }
            })
            .unwrap_or_else(|| PathBuf::from("./quarry_data"))
    }
}

/// Create the data directory if needed.
pub fn init_data_dir(path: &Path) -> QuarryResult<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(QuarryError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        QuarryError::storage(
            format!("Failed to create data directory '{}': {e}", path.display()),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// Source of saved connection descriptors.
pub trait ConnectionCatalog: Send + Sync {
    fn get(&self, id: Uuid) -> QuarryResult<Option<ConnectionConfig>>;

    /// All saved connections, ordered by name.
    fn list(&self) -> QuarryResult<Vec<ConnectionConfig>>;

    /// Insert or replace a descriptor.
    fn save(&self, config: &ConnectionConfig) -> QuarryResult<()>;

    /// Returns whether a descriptor was removed.
    fn delete(&self, id: Uuid) -> QuarryResult<bool>;

    /// Note a successful connect. Stores that do not track this ignore it.
    fn record_connected(&self, _id: Uuid) -> QuarryResult<()> {
        Ok(())
    }

    fn names(&self) -> QuarryResult<Vec<String>> {
        Ok(self.list()?.into_iter().map(|c| c.name).collect())
    }

    /// Like [`get`](Self::get), with a missing id as `NotFound`.
    fn require(&self, id: Uuid) -> QuarryResult<ConnectionConfig> {
        self.get(id)?.ok_or_else(|| QuarryError::connection_not_found(id))
    }
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: RwLock<HashMap<Uuid, ConnectionConfig>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: impl IntoIterator<Item = ConnectionConfig>) -> Self {
        Self { entries: RwLock::new(configs.into_iter().map(|c| (c.id, c)).collect()) }
    }
}

impl ConnectionCatalog for MemoryCatalog {
    fn get(&self, id: Uuid) -> QuarryResult<Option<ConnectionConfig>> {
        Ok(self.entries.read().get(&id).cloned())
    }

    fn list(&self) -> QuarryResult<Vec<ConnectionConfig>> {
        let mut configs: Vec<_> = self.entries.read().values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    fn save(&self, config: &ConnectionConfig) -> QuarryResult<()> {
        self.entries.write().insert(config.id, config.clone());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> QuarryResult<bool> {
        Ok(self.entries.write().remove(&id).is_some())
    }
}

/// Catalog row without secrets.
struct ConnectionRow {
    id: String,
    name: String,
    kind: String,
    host: String,
    port: i64,
    database: String,
    username: String,
    tls: bool,
    file_path: Option<String>,
    ssh_host: Option<String>,
    ssh_port: Option<i64>,
    ssh_username: Option<String>,
    ssh_auth_method: Option<String>,
    ssh_key_path: Option<String>,
    connect_timeout_secs: i64,
    statement_timeout_secs: Option<i64>,
    pool_max_size: i64,
    application_name: String,
}

const SELECT_COLUMNS: &str = "connection_id, name, kind, host, port, database_name, username, tls, \
     file_path, ssh_host, ssh_port, ssh_username, ssh_auth_method, ssh_key_path, \
     connect_timeout_secs, statement_timeout_secs, pool_max_size, application_name";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRow> {
    Ok(ConnectionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        database: row.get(5)?,
        username: row.get(6)?,
        tls: row.get(7)?,
        file_path: row.get(8)?,
        ssh_host: row.get(9)?,
        ssh_port: row.get(10)?,
        ssh_username: row.get(11)?,
        ssh_auth_method: row.get(12)?,
        ssh_key_path: row.get(13)?,
        connect_timeout_secs: row.get(14)?,
        statement_timeout_secs: row.get(15)?,
        pool_max_size: row.get(16)?,
        application_name: row.get(17)?,
    })
}

/// SQLite-backed catalog. Thread-safe via an internal mutex; WAL mode.
pub struct SqliteCatalog {
    connection: Mutex<Connection>,
    secrets: Arc<dyn SecretStore>,
    path: PathBuf,
}

impl SqliteCatalog {
    /// Open or create `quarry.db` in `data_dir`.
    pub fn open(data_dir: &Path, secrets: Arc<dyn SecretStore>) -> QuarryResult<Self> {
        init_data_dir(data_dir)?;
        Self::open_with_path(data_dir.join("quarry.db"), secrets)
    }

    /// Open a catalog at an explicit database path.
    pub fn open_with_path(path: PathBuf, secrets: Arc<dyn SecretStore>) -> QuarryResult<Self> {
        let connection = Connection::open(&path).map_err(|e| {
            QuarryError::storage(
                format!("Failed to open catalog '{}': {e}", path.display()),
                Some("The catalog file may be corrupted. Try deleting it to start fresh."),
            )
        })?;

        connection
            .execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                PRAGMA foreign_keys = ON;
                ",
            )
            .map_err(|e| QuarryError::storage(format!("Failed to configure catalog: {e}"), None))?;

        migrate(&connection)?;
        tracing::info!(
            path = %path.display(),
            secrets = secrets.name(),
            "Connection catalog opened"
        );

        Ok(Self { connection: Mutex::new(connection), secrets, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn hydrate(&self, row: ConnectionRow) -> QuarryResult<ConnectionConfig> {
        let id = Uuid::parse_str(&row.id).map_err(|e| {
            QuarryError::storage(format!("Invalid connection id '{}': {e}", row.id), None)
        })?;
        let kind = BackendKind::from_db_type(&row.kind).ok_or_else(|| {
            QuarryError::storage(format!("Unknown connection kind '{}'", row.kind), None)
        })?;

        let ssh_tunnel = match row.ssh_host {
            Some(host) => Some(SshTunnelConfig {
                host,
                port: u16::try_from(row.ssh_port.unwrap_or(22)).unwrap_or(22),
                username: row.ssh_username.unwrap_or_default(),
                auth_method: SshAuthMethod::parse(
                    row.ssh_auth_method.as_deref().unwrap_or("password"),
                ),
                password: self.secrets.get_secret(SecretKind::SshPassword, id)?,
                key_path: row.ssh_key_path.map(PathBuf::from),
                key_passphrase: self.secrets.get_secret(SecretKind::SshKeyPassphrase, id)?,
            }),
            None => None,
        };

        Ok(ConnectionConfig {
            id,
            name: row.name,
            kind,
            host: row.host,
            port: u16::try_from(row.port).unwrap_or(0),
            database: row.database,
            username: row.username,
            password: self.secrets.get_secret(SecretKind::DatabasePassword, id)?,
            tls: row.tls,
            file_path: row.file_path.map(PathBuf::from),
            ssh_tunnel,
            options: ConnectionOptions {
                connect_timeout_secs: u32::try_from(row.connect_timeout_secs).unwrap_or(10),
                statement_timeout_secs: row
                    .statement_timeout_secs
                    .and_then(|s| u32::try_from(s).ok()),
                pool_max_size: usize::try_from(row.pool_max_size).unwrap_or(4),
                application_name: row.application_name,
            },
        })
    }
}

/// Apply pending schema steps, tracked per domain like the rest of the data dir.
fn migrate(conn: &Connection) -> QuarryResult<()> {
    const DOMAIN: &str = "catalog";

    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            domain TEXT NOT NULL,
            step INTEGER NOT NULL,
            migration TEXT NOT NULL,
            PRIMARY KEY(domain, step)
        ) STRICT",
        [],
    )
    .map_err(|e| QuarryError::storage(format!("Failed to create migrations table: {e}"), None))?;

    let current_step: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
            [DOMAIN],
            |row| row.get(0),
        )
        .map_err(|e| QuarryError::storage(format!("Failed to read migration level: {e}"), None))?;

    if current_step < 1 {
        conn.execute_batch(
            "
            CREATE TABLE connections (
                connection_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                host TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL DEFAULT 0,
                database_name TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                tls INTEGER NOT NULL DEFAULT 0,
                file_path TEXT,
                ssh_host TEXT,
                ssh_port INTEGER,
                ssh_username TEXT,
                ssh_auth_method TEXT,
                ssh_key_path TEXT,
                connect_timeout_secs INTEGER NOT NULL DEFAULT 10,
                statement_timeout_secs INTEGER,
                pool_max_size INTEGER NOT NULL DEFAULT 4,
                application_name TEXT NOT NULL DEFAULT 'Quarry',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                last_connected_at TEXT
            ) STRICT;

            CREATE INDEX idx_connections_name ON connections(name);
            ",
        )
        .map_err(|e| QuarryError::storage(format!("Migration 1 failed: {e}"), None))?;

        conn.execute(
            "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'initial_schema')",
            [DOMAIN],
        )
        .map_err(|e| QuarryError::storage(format!("Failed to record migration: {e}"), None))?;

        tracing::info!("Applied catalog migration 1: initial_schema");
    }

    Ok(())
}

impl ConnectionCatalog for SqliteCatalog {
    fn get(&self, id: Uuid) -> QuarryResult<Option<ConnectionConfig>> {
        let row = {
            let conn = self.connection.lock();
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM connections WHERE connection_id = ?"),
                [id.to_string()],
                read_row,
            )
            .optional()
            .map_err(|e| QuarryError::storage(format!("Failed to load connection: {e}"), None))?
        };
        row.map(|r| self.hydrate(r)).transpose()
    }

    fn list(&self) -> QuarryResult<Vec<ConnectionConfig>> {
        let rows = {
            let conn = self.connection.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM connections ORDER BY name, created_at"
                ))
                .map_err(|e| QuarryError::storage(format!("Failed to prepare query: {e}"), None))?;
            let rows = stmt
                .query_map([], read_row)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| {
                    QuarryError::storage(format!("Failed to query connections: {e}"), None)
                })?;
            rows
        };
        rows.into_iter().map(|r| self.hydrate(r)).collect()
    }

    fn save(&self, config: &ConnectionConfig) -> QuarryResult<()> {
        let ssh = config.ssh_tunnel.as_ref();
        {
            let conn = self.connection.lock();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO connections (
                    connection_id, name, kind, host, port, database_name, username, tls,
                    file_path, ssh_host, ssh_port, ssh_username, ssh_auth_method, ssh_key_path,
                    connect_timeout_secs, statement_timeout_secs, pool_max_size, application_name,
                    created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19
                )
                ON CONFLICT(connection_id) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    host = excluded.host,
                    port = excluded.port,
                    database_name = excluded.database_name,
                    username = excluded.username,
                    tls = excluded.tls,
                    file_path = excluded.file_path,
                    ssh_host = excluded.ssh_host,
                    ssh_port = excluded.ssh_port,
                    ssh_username = excluded.ssh_username,
                    ssh_auth_method = excluded.ssh_auth_method,
                    ssh_key_path = excluded.ssh_key_path,
                    connect_timeout_secs = excluded.connect_timeout_secs,
                    statement_timeout_secs = excluded.statement_timeout_secs,
                    pool_max_size = excluded.pool_max_size,
                    application_name = excluded.application_name,
                    updated_at = excluded.updated_at",
                params![
                    config.id.to_string(),
                    config.name,
                    config.kind.db_type(),
                    config.host,
                    i64::from(config.port),
                    config.database,
                    config.username,
                    config.tls,
                    config.file_path.as_ref().map(|p| p.display().to_string()),
                    ssh.map(|t| t.host.clone()),
                    ssh.map(|t| i64::from(t.port)),
                    ssh.map(|t| t.username.clone()),
                    ssh.map(|t| t.auth_method.as_str()),
                    ssh.and_then(|t| t.key_path.as_ref()).map(|p| p.display().to_string()),
                    i64::from(config.options.connect_timeout_secs),
                    config.options.statement_timeout_secs.map(i64::from),
                    config.options.pool_max_size as i64,
                    config.options.application_name,
                    now,
                ],
            )
            .map_err(|e| QuarryError::storage(format!("Failed to save connection: {e}"), None))?;
        }

        self.secrets.put_or_clear(
            SecretKind::DatabasePassword,
            config.id,
            config.password.as_deref(),
        )?;
        self.secrets.put_or_clear(
            SecretKind::SshPassword,
            config.id,
            ssh.and_then(|t| t.password.as_deref()),
        )?;
        self.secrets.put_or_clear(
            SecretKind::SshKeyPassphrase,
            config.id,
            ssh.and_then(|t| t.key_passphrase.as_deref()),
        )?;

        tracing::debug!(connection_id = %config.id, name = %config.name, "Connection saved");
        Ok(())
    }

    fn delete(&self, id: Uuid) -> QuarryResult<bool> {
        let removed = {
            let conn = self.connection.lock();
            conn.execute("DELETE FROM connections WHERE connection_id = ?", [id.to_string()])
                .map_err(|e| {
                    QuarryError::storage(format!("Failed to delete connection: {e}"), None)
                })?
        };
        self.secrets.purge(id)?;
        tracing::debug!(connection_id = %id, removed, "Connection deleted");
        Ok(removed > 0)
    }

    fn record_connected(&self, id: Uuid) -> QuarryResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "UPDATE connections SET last_connected_at = ? WHERE connection_id = ?",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(|e| {
            QuarryError::storage(format!("Failed to update last_connected_at: {e}"), None)
        })?;
        Ok(())
    }
}
