//! Connection pool and unified database access layer for Quarry.
//!
//! - **error**: Error taxonomy shared by every backend
//! - **models**: Connection descriptors, table, query and key-value shapes
//! - **services**: Adapters, SSH tunnels, the pool, health checks, catalog
//! - **commands**: Flat JSON command surface over the pool
//! - **logging**: Structured logging setup

pub mod commands;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod verification_tests;

pub use error::{ErrorKind, ErrorResponse, QuarryError, QuarryResult};
pub use models::{
    BackendKind, ConnectionConfig, ConnectionOptions, ConnectionStatus, QueryResult, RowValue,
    SshAuthMethod, SshTunnelConfig, StatusReport, TableDataRequest, TestConnectionResult,
};
pub use services::{
    ConnectionCatalog, Connector, HealthMonitor, MemoryCatalog, NativeConnector, PoolManager,
    SqliteCatalog,
};
