//! Service layer for Quarry.
//!
//! - `adapter` - Backend adapter traits and the production connector
//! - `adapters` - PostgreSQL, SQLite, Redis and ClickHouse adapters
//! - `pool` - Connection registry with per-connection serialization
//! - `health` - Periodic liveness checks
//! - `tunnel` - SSH local port forwarding
//! - `validator` - Raw-SQL allow-list
//! - `statements` - Statement text builders
//! - `scan` - Cursor-based key scan
//! - `catalog` - Saved connection storage
//! - `credentials` - OS keychain integration
//! - `interchange` - Connection export/import

pub mod adapter;
pub mod adapters;
pub mod catalog;
pub mod credentials;
pub mod health;
pub mod interchange;
pub mod pool;
pub mod scan;
pub mod statements;
pub mod tunnel;
pub mod validator;

pub use adapter::{Connector, DatabaseAdapter, KeyValueAdapter, NativeConnector, TunnelHandle};
pub use catalog::{ConnectionCatalog, MemoryCatalog, SqliteCatalog};
pub use credentials::{KeyringSecrets, MemorySecrets, SecretStore};
pub use health::HealthMonitor;
pub use interchange::{ConnectionsExport, ExportedConnection};
pub use pool::{PoolEvent, PoolManager};
