//! Data models for the Quarry access layer.
//!
//! - `connection` - ConnectionConfig, BackendKind, SshTunnelConfig
//! - `status` - ConnectionStatus, StatusReport
//! - `table` - Table listing, structure and paging
//! - `query` - QueryResult and row edit requests
//! - `keys` - Key-value scan and detail models

pub mod connection;
pub mod keys;
pub mod query;
pub mod status;
pub mod table;

pub use connection::{
    BackendKind, ConnectionConfig, ConnectionConfigBuilder, ConnectionOptions, SshAuthMethod,
    SshTunnelConfig,
};
pub use keys::{effective_ttl, KeyDetails, KeyInfo, KeySearchPage, KeyType, NO_EXPIRY};
pub use query::{QueryResult, RowDelete, RowInsert, RowUpdate, RowValue, TestConnectionResult};
pub use status::{ConnectionStatus, StatusReport};
pub use table::{
    ColumnInfo, ForeignKeyInfo, IndexInfo, SchemaOverview, SortDirection, TableData,
    TableDataRequest, TableInfo, TableStructure, TableWithStructure, MAX_PAGE_SIZE,
};
