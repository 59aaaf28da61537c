//! Process-wide registry of live backend sessions.
//!
//! Each connection identifier maps to one [`PoolEntry`]. An entry owns a
//! gate (`tokio::sync::Mutex<Session>`) that every operation on that
//! identifier holds for its whole duration, reconnects included, so at most
//! one adapter is live per identifier and calls on it are linearized. Status
//! lives in a separate snapshot lock that [`PoolManager::status`] reads
//! without waiting on the gate.
//!
//! Data operations go through [`PoolManager::with_connected`]: ensure the
//! entry is connected, delegate to the adapter, and mark the entry
//! disconnected when the adapter reports a connection-class failure. The
//! failing call returns its error; the next call dials again.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ConnectionConfig, ConnectionStatus, KeyDetails, KeySearchPage, QueryResult,
    RowDelete, RowInsert, RowUpdate, SchemaOverview, StatusReport, TableData, TableDataRequest,
    TableInfo, TableStructure, TestConnectionResult,
};
use crate::services::adapter::{Connector, DatabaseAdapter, Endpoint, KeyValueAdapter, TunnelHandle};
use crate::services::catalog::ConnectionCatalog;
use crate::services::statements;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications consumed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Connected(Uuid),
    Disconnected(Uuid),
    Removed(Uuid),
}

/// Live handles of one entry. Only reachable through the entry gate.
#[derive(Default)]
pub struct Session {
    adapter: Option<Box<dyn DatabaseAdapter>>,
    tunnel: Option<Box<dyn TunnelHandle>>,
}

impl Session {
    fn is_open(&self) -> bool {
        self.adapter.is_some()
    }

    /// Close the adapter, then the tunnel it dials through.
    async fn close(&mut self) {
        if let Some(adapter) = self.adapter.take() {
            adapter.close().await;
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    status: ConnectionStatus,
    error: Option<String>,
    last_healthy_at: Option<DateTime<Utc>>,
    kind: Option<BackendKind>,
}

/// Run-time record for one connection identifier.
pub struct PoolEntry {
    id: Uuid,
    gate: Arc<Mutex<Session>>,
    state: RwLock<Snapshot>,
    retired: AtomicBool,
}

impl PoolEntry {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            gate: Arc::new(Mutex::new(Session::default())),
            state: RwLock::new(Snapshot::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn kind(&self) -> Option<BackendKind> {
        self.state.read().kind
    }

    pub fn report(&self) -> StatusReport {
        let state = self.state.read();
        StatusReport {
            status: state.status,
            error: state.error.clone(),
            last_healthy_at: state.last_healthy_at,
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.write().status = status;
    }

    fn mark_connected(&self, kind: BackendKind) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Connected;
        state.error = None;
        state.last_healthy_at = Some(Utc::now());
        state.kind = Some(kind);
    }

    fn mark_disconnected(&self, error: Option<String>) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Disconnected;
        state.error = error;
    }

    fn mark_healthy(&self) {
        self.state.write().last_healthy_at = Some(Utc::now());
    }
}

/// Registry of pool entries keyed by connection identifier.
pub struct PoolManager {
    catalog: Arc<dyn ConnectionCatalog>,
    connector: Arc<dyn Connector>,
    entries: RwLock<HashMap<Uuid, Arc<PoolEntry>>>,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolManager {
    pub fn new(catalog: Arc<dyn ConnectionCatalog>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self { catalog, connector, entries: RwLock::new(HashMap::new()), events })
    }

    pub fn catalog(&self) -> &Arc<dyn ConnectionCatalog> {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: PoolEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Entry for `id`, created on first use.
    fn entry(&self, id: Uuid) -> Arc<PoolEntry> {
        if let Some(entry) = self.entries.read().get(&id) {
            return Arc::clone(entry);
        }
        Arc::clone(self.entries.write().entry(id).or_insert_with(|| Arc::new(PoolEntry::new(id))))
    }

    fn existing(&self, id: Uuid) -> Option<Arc<PoolEntry>> {
        self.entries.read().get(&id).cloned()
    }

    /// Acquire the gate of the current entry for `id`.
    ///
    /// An entry retired by `disconnect` while we waited is skipped in favor of
    /// its replacement.
    async fn lock_entry(&self, id: Uuid) -> (Arc<PoolEntry>, OwnedMutexGuard<Session>) {
        loop {
            let entry = self.entry(id);
            let session = Arc::clone(&entry.gate).lock_owned().await;
            if !entry.retired.load(Ordering::SeqCst) {
                return (entry, session);
            }
        }
    }

    // ========== Lifecycle ==========

    /// Connect `id`. Succeeds immediately when already connected.
    pub async fn connect(&self, id: Uuid) -> QuarryResult<StatusReport> {
        let (entry, mut session) = self.lock_entry(id).await;
        self.ensure_connected(&entry, &mut session).await?;
        Ok(entry.report())
    }

    async fn ensure_connected(&self, entry: &PoolEntry, session: &mut Session) -> QuarryResult<()> {
        if session.is_open() && entry.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let config = match self.catalog.require(entry.id) {
            Ok(config) => config,
            Err(e) => {
                entry.mark_disconnected(Some(e.to_string()));
                return Err(e);
            }
        };

        let reconnecting = session.is_open();
        if reconnecting {
            tracing::debug!(connection_id = %entry.id, "Closing stale session before reconnect");
            session.close().await;
        }
        entry.set_status(if reconnecting {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        });

        let start = Instant::now();
        match self.dial(&config).await {
            Ok((adapter, tunnel)) => {
                session.adapter = Some(adapter);
                session.tunnel = tunnel;
                entry.mark_connected(config.kind);
                if let Err(e) = self.catalog.record_connected(entry.id) {
                    tracing::warn!(
                        connection_id = %entry.id,
                        error = %e,
                        "Failed to record connect time"
                    );
                }
                tracing::info!(
                    connection_id = %entry.id,
                    kind = ?config.kind,
                    reconnect = reconnecting,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Connected"
                );
                self.publish(PoolEvent::Connected(entry.id));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %entry.id,
                    kind = ?config.kind,
                    error = %e,
                    "Connect failed"
                );
                entry.mark_disconnected(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Open the tunnel (if any) and the adapter. A failed adapter dial closes
    /// the tunnel it would have used.
    async fn dial(
        &self,
        config: &ConnectionConfig,
    ) -> QuarryResult<(Box<dyn DatabaseAdapter>, Option<Box<dyn TunnelHandle>>)> {
        config.validate().map_err(QuarryError::validation)?;
        let tunnel = self.connector.open_tunnel(config).await?;
        let endpoint = Endpoint::resolve(config, tunnel.as_deref());
        match self.connector.open_adapter(config, endpoint).await {
            Ok(adapter) => Ok((adapter, tunnel)),
            Err(e) => {
                if let Some(tunnel) = tunnel {
                    tunnel.close().await;
                }
                Err(e)
            }
        }
    }

    /// Close and forget `id`. No-op when the pool has never seen it.
    pub async fn disconnect(&self, id: Uuid) -> StatusReport {
        let Some(entry) = self.existing(id) else {
            return StatusReport::disconnected();
        };
        let mut session = Arc::clone(&entry.gate).lock_owned().await;
        if entry.retired.swap(true, Ordering::SeqCst) {
            return StatusReport::disconnected();
        }

        session.close().await;
        entry.mark_disconnected(None);
        {
            let mut entries = self.entries.write();
            if entries.get(&id).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                entries.remove(&id);
            }
        }
        drop(session);

        tracing::info!(connection_id = %id, "Disconnected");
        self.publish(PoolEvent::Removed(id));
        StatusReport::disconnected()
    }

    /// Close every entry and clear the registry.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<PoolEntry>> =
            self.entries.write().drain().map(|(_, entry)| entry).collect();
        let count = entries.len();
        for entry in entries {
            let mut session = Arc::clone(&entry.gate).lock_owned().await;
            entry.retired.store(true, Ordering::SeqCst);
            session.close().await;
            entry.mark_disconnected(None);
            self.publish(PoolEvent::Removed(entry.id));
        }
        tracing::info!(closed = count, "Pool shut down");
    }

    // ========== Status ==========

    /// Current status of `id`. Never blocks and never dials.
    pub fn status(&self, id: Uuid) -> StatusReport {
        self.existing(id).map(|e| e.report()).unwrap_or_else(StatusReport::disconnected)
    }

    pub fn statuses(&self) -> BTreeMap<Uuid, StatusReport> {
        self.entries.read().iter().map(|(id, entry)| (*id, entry.report())).collect()
    }

    pub fn connected_ids(&self) -> Vec<Uuid> {
        self.entries
            .read()
            .values()
            .filter(|e| e.status() == ConnectionStatus::Connected)
            .map(|e| e.id)
            .collect()
    }

    /// Ping the existing session without reconnecting.
    ///
    /// A failed ping marks the entry disconnected and leaves the handle in
    /// place; the next data operation replaces it.
    pub async fn health_check(&self, id: Uuid) -> TestConnectionResult {
        let Some(entry) = self.existing(id) else {
            return TestConnectionResult::failed("Connection is not open");
        };
        let session = Arc::clone(&entry.gate).lock_owned().await;
        let Some(adapter) = session.adapter.as_deref() else {
            return TestConnectionResult::failed("Connection is not open");
        };
        if entry.status() != ConnectionStatus::Connected {
            return TestConnectionResult::failed(
                entry.report().error.unwrap_or_else(|| "Connection is not open".to_string()),
            );
        }

        match adapter.ping().await {
            Ok(()) => {
                entry.mark_healthy();
                tracing::trace!(connection_id = %id, "Health check passed");
                TestConnectionResult::ok("Connection healthy")
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Health check failed");
                entry.mark_disconnected(Some(e.to_string()));
                self.publish(PoolEvent::Disconnected(id));
                TestConnectionResult::failed(e.to_string())
            }
        }
    }

    /// Test a configuration without creating an entry.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> TestConnectionResult {
        self.connector.test_connection(config).await
    }

    // ========== Ensure-connected wrappers ==========

    /// Run `op` against the adapter of `id`, connecting first when needed.
    pub async fn with_connected<T, F>(&self, id: Uuid, op: F) -> QuarryResult<T>
    where
        F: for<'a> FnOnce(&'a dyn DatabaseAdapter) -> BoxFuture<'a, QuarryResult<T>>,
    {
        let (entry, mut session) = self.lock_entry(id).await;
        self.ensure_connected(&entry, &mut session).await?;
        let adapter = session
            .adapter
            .as_deref()
            .ok_or_else(|| QuarryError::internal("Connected entry has no adapter"))?;

        let result = op(adapter).await;
        if let Err(ref e) = result {
            if e.is_connection_failure() {
                tracing::warn!(connection_id = %id, error = %e, "Marking connection disconnected");
                entry.mark_disconnected(Some(e.to_string()));
                self.publish(PoolEvent::Disconnected(id));
            }
        }
        result
    }

    /// Like [`with_connected`](Self::with_connected), for key-value only
    /// operations.
    pub async fn with_key_value<T, F>(
        &self,
        id: Uuid,
        operation: &'static str,
        op: F,
    ) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a dyn KeyValueAdapter) -> BoxFuture<'a, QuarryResult<T>>,
    {
        self.with_connected(id, move |adapter| match adapter.as_key_value() {
            Some(kv) => op(kv),
            None => {
                let kind = adapter.kind();
                async move { Err(QuarryError::unsupported(operation, kind)) }.boxed()
            }
        })
        .await
    }

    // ========== Data operations ==========

    pub async fn list_tables(&self, id: Uuid) -> QuarryResult<Vec<TableInfo>> {
        self.with_connected(id, |a| a.list_tables()).await
    }

    pub async fn get_table_structure(
        &self,
        id: Uuid,
        schema: &str,
        table: &str,
    ) -> QuarryResult<TableStructure> {
        let (schema, table) = (schema.to_string(), table.to_string());
        self.with_connected(id, move |a| {
            Box::pin(async move { a.get_table_structure(&schema, &table).await })
        })
        .await
    }

    pub async fn get_table_data(&self, id: Uuid, req: TableDataRequest) -> QuarryResult<TableData> {
        self.with_connected(id, move |a| Box::pin(async move { a.get_table_data(&req).await }))
            .await
    }

    pub async fn schema_overview(&self, id: Uuid) -> QuarryResult<SchemaOverview> {
        self.with_connected(id, |a| a.schema_overview()).await
    }

    /// Empty query text is rejected before any dial.
    pub async fn execute_query(&self, id: Uuid, query: &str) -> QuarryResult<QueryResult> {
        let query = statements::check_query_text(query)?.to_string();
        self.with_connected(id, move |a| Box::pin(async move { a.execute_query(&query).await }))
            .await
    }

    pub async fn insert_row(&self, id: Uuid, req: RowInsert) -> QuarryResult<QueryResult> {
        statements::check_insert(&req)?;
        self.with_connected(id, move |a| Box::pin(async move { a.insert_row(&req).await })).await
    }

    pub async fn update_row(&self, id: Uuid, req: RowUpdate) -> QuarryResult<QueryResult> {
        statements::check_update(&req)?;
        self.with_connected(id, move |a| Box::pin(async move { a.update_row(&req).await })).await
    }

    pub async fn delete_row(&self, id: Uuid, req: RowDelete) -> QuarryResult<QueryResult> {
        statements::check_delete(&req)?;
        self.with_connected(id, move |a| Box::pin(async move { a.delete_row(&req).await })).await
    }

    // ========== Key-value operations ==========

    pub async fn search_keys(
        &self,
        id: Uuid,
        pattern: &str,
        limit: usize,
        cursor: &str,
    ) -> QuarryResult<KeySearchPage> {
        let (pattern, cursor) = (pattern.to_string(), cursor.to_string());
        self.with_key_value(id, "redis_search_keys", move |kv| {
            Box::pin(async move { kv.search_keys(&pattern, limit, &cursor).await })
        })
        .await
    }

    pub async fn get_key_details(&self, id: Uuid, key: &str) -> QuarryResult<KeyDetails> {
        let key = key.to_string();
        self.with_key_value(id, "redis_get_key_details", move |kv| {
            Box::pin(async move { kv.get_key_details(&key).await })
        })
        .await
    }

    pub async fn set_key(
        &self,
        id: Uuid,
        key: &str,
        value: &str,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_key_value(id, "redis_set_key", move |kv| {
            Box::pin(async move { kv.set_key(&key, &value, ttl).await })
        })
        .await
    }

    pub async fn set_list(
        &self,
        id: Uuid,
        key: &str,
        values: Vec<String>,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let key = key.to_string();
        self.with_key_value(id, "redis_set_list", move |kv| {
            Box::pin(async move { kv.set_list(&key, &values, ttl).await })
        })
        .await
    }

    pub async fn set_set(
        &self,
        id: Uuid,
        key: &str,
        members: Vec<String>,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let key = key.to_string();
        self.with_key_value(id, "redis_set_set", move |kv| {
            Box::pin(async move { kv.set_set(&key, &members, ttl).await })
        })
        .await
    }

    pub async fn set_hash(
        &self,
        id: Uuid,
        key: &str,
        fields: BTreeMap<String, String>,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let key = key.to_string();
        self.with_key_value(id, "redis_set_hash", move |kv| {
            Box::pin(async move { kv.set_hash(&key, &fields, ttl).await })
        })
        .await
    }

    pub async fn set_zset(
        &self,
        id: Uuid,
        key: &str,
        members: Vec<(String, f64)>,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let key = key.to_string();
        self.with_key_value(id, "redis_set_zset", move |kv| {
            Box::pin(async move { kv.set_zset(&key, &members, ttl).await })
        })
        .await
    }

    pub async fn update_ttl(&self, id: Uuid, key: &str, ttl: Option<i64>) -> QuarryResult<()> {
        let key = key.to_string();
        self.with_key_value(id, "redis_update_ttl", move |kv| {
            Box::pin(async move { kv.update_ttl(&key, ttl).await })
        })
        .await
    }

    pub async fn delete_key(&self, id: Uuid, key: &str) -> QuarryResult<bool> {
        let key = key.to_string();
        self.with_key_value(id, "redis_delete_key", move |kv| {
            Box::pin(async move { kv.delete_key(&key).await })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::MemoryCatalog;
    use crate::test_support::{key_value_config, relational_config, tunneled_config, FakeConnector};

    fn pool_with(configs: Vec<ConnectionConfig>) -> (Arc<PoolManager>, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::new());
        let pool =
            PoolManager::new(Arc::new(MemoryCatalog::with_configs(configs)), connector.clone());
        (pool, connector)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let config = relational_config("primary");
        let (pool, connector) = pool_with(vec![config.clone()]);

        let first = pool.connect(config.id).await.unwrap();
        let second = pool.connect(config.id).await.unwrap();
        assert_eq!(first.status, ConnectionStatus::Connected);
        assert_eq!(second.status, ConnectionStatus::Connected);
        assert!(second.last_healthy_at.is_some());
        assert_eq!(connector.dial_count(), 1);
        assert_eq!(pool.connected_ids(), vec![config.id]);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (pool, connector) = pool_with(vec![]);
        let id = Uuid::new_v4();

        let err = pool.connect(id).await.unwrap_err();
        assert!(matches!(err, QuarryError::NotFound { .. }));
        assert_eq!(connector.dial_count(), 0);

        let report = pool.status(id);
        assert_eq!(report.status, ConnectionStatus::Disconnected);
        assert!(report.error.unwrap().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn test_failed_dial_records_error_and_closes_tunnel() {
        let config = tunneled_config("behind-bastion");
        let (pool, connector) = pool_with(vec![config.clone()]);
        connector.fail_next_dials(1);

        let err = pool.connect(config.id).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(pool.status(config.id).status, ConnectionStatus::Disconnected);
        assert_eq!(connector.backend().journal(), vec![format!("tunnel:{}", config.id)]);

        pool.connect(config.id).await.unwrap();
        assert_eq!(connector.dial_count(), 2);
        assert!(pool.status(config.id).error.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_marks_disconnected_without_retry() {
        let config = relational_config("flaky");
        let (pool, connector) = pool_with(vec![config.clone()]);
        pool.connect(config.id).await.unwrap();

        connector.backend().break_transport(true);
        let err = pool.list_tables(config.id).await.unwrap_err();
        assert!(matches!(err, QuarryError::Network { .. }));
        assert_eq!(connector.dial_count(), 1);
        assert_eq!(pool.status(config.id).status, ConnectionStatus::Disconnected);

        connector.backend().break_transport(false);
        let tables = pool.list_tables(config.id).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(connector.dial_count(), 2);
        assert_eq!(connector.backend().live_adapters(), 1);
    }

    #[tokio::test]
    async fn test_statement_errors_stay_in_band() {
        let config = relational_config("analytics");
        let (pool, connector) = pool_with(vec![config.clone()]);

        let result = pool.execute_query(config.id, "SELECT 1/0").await.unwrap();
        assert!(result.is_error());
        assert_eq!(pool.status(config.id).status, ConnectionStatus::Connected);

        let err = pool.execute_query(config.id, "   ").await.unwrap_err();
        assert!(matches!(err, QuarryError::Precondition { .. }));
        assert_eq!(connector.backend().executed().len(), 1);
    }

    #[tokio::test]
    async fn test_key_value_ops_require_key_value_adapter() {
        let pg = relational_config("pg");
        let cache = key_value_config("cache");
        let (pool, _connector) = pool_with(vec![pg.clone(), cache.clone()]);

        let err = pool.get_key_details(pg.id, "session:1").await.unwrap_err();
        assert!(matches!(err, QuarryError::Unsupported { .. }));
        assert_eq!(pool.status(pg.id).status, ConnectionStatus::Connected);

        pool.set_key(cache.id, "session:1", "alice", None).await.unwrap();
        let details = pool.get_key_details(cache.id, "session:1").await.unwrap();
        assert_eq!(details.value, serde_json::json!("alice"));
        assert_eq!(details.ttl, -1);
        assert!(pool.delete_key(cache.id, "session:1").await.unwrap());
        assert!(!pool.delete_key(cache.id, "session:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let a = tunneled_config("a");
        let b = relational_config("b");
        let (pool, connector) = pool_with(vec![a.clone(), b.clone()]);
        let mut events = pool.subscribe();
        pool.connect(a.id).await.unwrap();
        pool.connect(b.id).await.unwrap();

        pool.shutdown().await;
        assert!(pool.statuses().is_empty());
        assert_eq!(connector.backend().live_adapters(), 0);

        let journal = connector.backend().journal();
        let adapter_pos = journal.iter().position(|e| *e == format!("adapter:{}", a.id)).unwrap();
        let tunnel_pos = journal.iter().position(|e| *e == format!("tunnel:{}", a.id)).unwrap();
        assert!(adapter_pos < tunnel_pos);

        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PoolEvent::Removed(_)) {
                removed += 1;
            }
        }
        assert_eq!(removed, 2);
    }
}
