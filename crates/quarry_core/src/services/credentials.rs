//! Secret storage for saved connections.
//!
//! Passwords and key passphrases never touch the catalog database. They go
//! through a [`SecretStore`]:
//!
//! - [`KeyringSecrets`]: OS keychain (macOS Keychain, Windows Credential
//!   Manager, Linux Secret Service). The default.
//! - [`MemorySecrets`]: process-lifetime storage for tests, embedding, and
//!   headless hosts without a keychain. Selected with `QUARRY_SESSION_SECRETS=1`.

use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};

/// Service name used for keychain entries.
const KEYRING_SERVICE: &str = "dev.quarry.Quarry";

/// Environment variable selecting in-memory secrets.
pub const SESSION_SECRETS_ENV: &str = "QUARRY_SESSION_SECRETS";

/// Which secret of a connection an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    DatabasePassword,
    SshPassword,
    SshKeyPassphrase,
}

impl SecretKind {
    pub const ALL: [SecretKind; 3] =
        [Self::DatabasePassword, Self::SshPassword, Self::SshKeyPassphrase];

    /// Entry name for this secret of `connection_id`.
    pub fn key(&self, connection_id: Uuid) -> String {
        match self {
            Self::DatabasePassword => format!("db:{connection_id}"),
            Self::SshPassword => format!("ssh:{connection_id}"),
            Self::SshKeyPassphrase => format!("ssh-key:{connection_id}"),
        }
    }
}

/// Pluggable secret backend.
pub trait SecretStore: Send + Sync {
    fn store(&self, key: &str, value: &str) -> QuarryResult<()>;

    fn get(&self, key: &str) -> QuarryResult<Option<String>>;

    /// Remove an entry. Missing entries are not an error.
    fn delete(&self, key: &str) -> QuarryResult<()>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Store `value` when present and non-empty, otherwise remove the entry.
    fn put_or_clear(
        &self,
        kind: SecretKind,
        connection_id: Uuid,
        value: Option<&str>,
    ) -> QuarryResult<()> {
        let key = kind.key(connection_id);
        match value.filter(|v| !v.is_empty()) {
            Some(v) => self.store(&key, v),
            None => self.delete(&key),
        }
    }

    fn get_secret(&self, kind: SecretKind, connection_id: Uuid) -> QuarryResult<Option<String>> {
        self.get(&kind.key(connection_id))
    }

    /// Remove every secret of a connection.
    fn purge(&self, connection_id: Uuid) -> QuarryResult<()> {
        for kind in SecretKind::ALL {
            self.delete(&kind.key(connection_id))?;
        }
        Ok(())
    }
}

/// OS keychain storage.
#[derive(Debug)]
pub struct KeyringSecrets {
    service: String,
}

impl Default for KeyringSecrets {
    fn default() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl KeyringSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, key: &str) -> QuarryResult<Entry> {
        Entry::new(&self.service, key).map_err(|e| QuarryError::credential(e.to_string(), None))
    }
}

impl SecretStore for KeyringSecrets {
    fn store(&self, key: &str, value: &str) -> QuarryResult<()> {
        self.entry(key)?.set_password(value)?;
        tracing::debug!(key, "Secret stored in keychain");
        Ok(())
    }

    fn get(&self, key: &str) -> QuarryResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> QuarryResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(key, "Secret deleted from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "KeyringSecrets"
    }
}

/// Process-lifetime secret storage. Secrets are lost on exit.
#[derive(Debug, Default)]
pub struct MemorySecrets {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SecretStore for MemorySecrets {
    fn store(&self, key: &str, value: &str) -> QuarryResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> QuarryResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> QuarryResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemorySecrets"
    }
}

/// Keychain unless `QUARRY_SESSION_SECRETS=1`.
pub fn default_secret_store() -> Arc<dyn SecretStore> {
    let session_only = std::env::var(SESSION_SECRETS_ENV).map(|v| v == "1").unwrap_or(false);
    let store: Arc<dyn SecretStore> = if session_only {
        Arc::new(MemorySecrets::new())
    } else {
        Arc::new(KeyringSecrets::new())
    };
    tracing::info!(provider = store.name(), "Secret store selected");
    store
}
