//! Backend adapter traits and the production connector.
//!
//! Every backend implements [`DatabaseAdapter`]. Key-value specific
//! operations live on the narrower [`KeyValueAdapter`], reachable through
//! [`DatabaseAdapter::as_key_value`]. The pool never constructs adapters or
//! tunnels itself; it goes through a [`Connector`], which lets tests swap
//! in doubles.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ConnectionConfig, KeyDetails, KeySearchPage, QueryResult, RowDelete, RowInsert,
    RowUpdate, SchemaOverview, TableData, TableDataRequest, TableInfo, TableStructure,
    TestConnectionResult,
};
use crate::services::adapters::{ClickhouseAdapter, PostgresAdapter, RedisAdapter, SqliteAdapter};
use crate::services::statements;
use crate::services::tunnel::SshTunnel;

/// Common operation surface of a live backend session.
///
/// An adapter is owned by exactly one pool entry and is only reached while
/// that entry's gate is held.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Minimal round trip on the existing session.
    async fn ping(&self) -> QuarryResult<()>;

    async fn list_tables(&self) -> QuarryResult<Vec<TableInfo>>;

    async fn get_table_structure(&self, schema: &str, table: &str) -> QuarryResult<TableStructure>;

    async fn get_table_data(&self, req: &TableDataRequest) -> QuarryResult<TableData>;

    /// Run `query` exactly as given.
    ///
    /// Statement failures are reported in [`QueryResult::error`]; `Err` is
    /// reserved for transport failures.
    async fn execute_query(&self, query: &str) -> QuarryResult<QueryResult>;

    /// Every table with its structure, from one introspection pass.
    async fn schema_overview(&self) -> QuarryResult<SchemaOverview>;

    async fn insert_row(&self, req: &RowInsert) -> QuarryResult<QueryResult> {
        let sql = statements::insert_statement(self.kind(), req)?;
        self.execute_query(&sql).await
    }

    async fn update_row(&self, req: &RowUpdate) -> QuarryResult<QueryResult> {
        let sql = statements::update_statement(self.kind(), req)?;
        self.execute_query(&sql).await
    }

    async fn delete_row(&self, req: &RowDelete) -> QuarryResult<QueryResult> {
        let sql = statements::delete_statement(self.kind(), req)?;
        self.execute_query(&sql).await
    }

    /// Release the session. Safe to call more than once.
    async fn close(&self);

    fn as_key_value(&self) -> Option<&dyn KeyValueAdapter> {
        None
    }
}

/// Operations only key-value backends support.
#[async_trait]
pub trait KeyValueAdapter: Send + Sync {
    async fn search_keys(
        &self,
        pattern: &str,
        limit: usize,
        cursor: &str,
    ) -> QuarryResult<KeySearchPage>;

    async fn get_key_details(&self, key: &str) -> QuarryResult<KeyDetails>;

    async fn set_key(&self, key: &str, value: &str, ttl: Option<i64>) -> QuarryResult<()>;

    async fn set_list(&self, key: &str, values: &[String], ttl: Option<i64>) -> QuarryResult<()>;

    async fn set_set(&self, key: &str, members: &[String], ttl: Option<i64>) -> QuarryResult<()>;

    async fn set_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Option<i64>,
    ) -> QuarryResult<()>;

    async fn set_zset(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl: Option<i64>,
    ) -> QuarryResult<()>;

    /// `Some(n)` expires the key after n seconds; `None` makes it persistent.
    async fn update_ttl(&self, key: &str, ttl: Option<i64>) -> QuarryResult<()>;

    /// Returns whether a key was removed.
    async fn delete_key(&self, key: &str) -> QuarryResult<bool>;
}

/// An open SSH forward.
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    /// Local port the adapter should dial.
    fn local_port(&self) -> u16;

    /// Stop forwarding and drop the SSH session. Safe to call more than once.
    async fn close(&self);
}

/// Address the adapter dials, after tunneling is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn resolve(config: &ConnectionConfig, tunnel: Option<&dyn TunnelHandle>) -> Self {
        match tunnel {
            Some(t) => Self { host: "127.0.0.1".to_string(), port: t.local_port() },
            None => Self { host: config.host.clone(), port: config.port },
        }
    }
}

/// Opens tunnels and adapters for a connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the SSH forward if the connection has one configured.
    async fn open_tunnel(
        &self,
        config: &ConnectionConfig,
    ) -> QuarryResult<Option<Box<dyn TunnelHandle>>>;

    /// Open and verify an adapter against `endpoint`.
    async fn open_adapter(
        &self,
        config: &ConnectionConfig,
        endpoint: Endpoint,
    ) -> QuarryResult<Box<dyn DatabaseAdapter>>;

    /// Dial a connection without registering it anywhere.
    ///
    /// Both the adapter and the tunnel are closed afterwards, adapter first.
    async fn test_connection(&self, config: &ConnectionConfig) -> TestConnectionResult {
        match dial_and_close(self, config).await {
            Ok(()) => TestConnectionResult::ok("Connection successful!"),
            Err(e) => {
                tracing::debug!(name = %config.name, error = %e, "Test connection failed");
                TestConnectionResult::failed(e.to_string())
            }
        }
    }
}

async fn dial_and_close<C: Connector + ?Sized>(
    connector: &C,
    config: &ConnectionConfig,
) -> QuarryResult<()> {
    config.validate().map_err(QuarryError::validation)?;
    let tunnel = connector.open_tunnel(config).await?;
    let endpoint = Endpoint::resolve(config, tunnel.as_deref());

    let result = match connector.open_adapter(config, endpoint).await {
        Ok(adapter) => {
            let ping = adapter.ping().await;
            adapter.close().await;
            ping
        }
        Err(e) => Err(e),
    };

    if let Some(tunnel) = tunnel {
        tunnel.close().await;
    }
    result
}

/// Connector for real backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

impl NativeConnector {
    pub fn new() -> Self {
        Self
    }
}

fn connect_timeout(config: &ConnectionConfig) -> Duration {
    Duration::from_secs(u64::from(config.options.connect_timeout_secs.max(1)))
}

#[async_trait]
impl Connector for NativeConnector {
    async fn open_tunnel(
        &self,
        config: &ConnectionConfig,
    ) -> QuarryResult<Option<Box<dyn TunnelHandle>>> {
        let Some(ssh) = config.ssh_tunnel.as_ref() else {
            return Ok(None);
        };
        let timeout = connect_timeout(config);
        match tokio::time::timeout(timeout, SshTunnel::open(ssh, &config.host, config.port)).await {
            Ok(Ok(tunnel)) => Ok(Some(Box::new(tunnel))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QuarryError::tunnel_with_hint(
                format!(
                    "SSH connection to {}:{} timed out after {}s",
                    ssh.host,
                    ssh.port,
                    timeout.as_secs()
                ),
                "Check that the SSH host is reachable",
            )),
        }
    }

    async fn open_adapter(
        &self,
        config: &ConnectionConfig,
        endpoint: Endpoint,
    ) -> QuarryResult<Box<dyn DatabaseAdapter>> {
        let timeout = connect_timeout(config);
        let open = async {
            let adapter: Box<dyn DatabaseAdapter> = match config.kind {
                BackendKind::Relational => {
                    Box::new(PostgresAdapter::connect(config, &endpoint).await?)
                }
                BackendKind::FileBased => Box::new(SqliteAdapter::open(config).await?),
                BackendKind::KeyValue => Box::new(RedisAdapter::connect(config, &endpoint).await?),
                BackendKind::ColumnStore => {
                    Box::new(ClickhouseAdapter::connect(config, &endpoint).await?)
                }
            };
            Ok::<_, QuarryError>(adapter)
        };

        match tokio::time::timeout(timeout, open).await {
            Ok(result) => result,
            Err(_) => Err(QuarryError::network_with_hint(
                format!(
                    "Connection to {}:{} timed out after {}s",
                    endpoint.host,
                    endpoint.port,
                    timeout.as_secs()
                ),
                "Check that the server is running and reachable",
            )),
        }
    }
}
