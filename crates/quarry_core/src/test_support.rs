//! Test doubles for the pool and adapter layers.
//!
//! [`FakeConnector`] hands out [`FakeAdapter`]s and [`FakeTunnel`]s that share
//! one [`FakeBackend`]. The backend counts dials, pings and adapter calls,
//! records executed statements, and writes close events into an ordered
//! journal (`"adapter:<id>"`, `"tunnel:<id>"`).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    effective_ttl, BackendKind, ColumnInfo, ConnectionConfig, IndexInfo, KeyDetails, KeyInfo,
    KeySearchPage, KeyType, QueryResult, SchemaOverview, SortDirection, SshTunnelConfig, TableData,
    TableDataRequest, TableInfo, TableStructure, TableWithStructure, NO_EXPIRY,
};
use crate::services::adapter::{Connector, DatabaseAdapter, Endpoint, KeyValueAdapter, TunnelHandle};
use crate::services::scan::{self, KeyScanner};

// ========== Configs ==========

pub fn relational_config(name: &str) -> ConnectionConfig {
    ConnectionConfig::builder(BackendKind::Relational)
        .name(name)
        .host("db.internal")
        .database("app")
        .username("app")
        .password("app-secret")
        .build()
        .unwrap()
}

pub fn tunneled_config(name: &str) -> ConnectionConfig {
    ConnectionConfig::builder(BackendKind::Relational)
        .name(name)
        .host("10.0.0.12")
        .database("app")
        .username("app")
        .ssh_tunnel(SshTunnelConfig::new("bastion.internal", "deploy").with_password("jump-secret"))
        .build()
        .unwrap()
}

pub fn key_value_config(name: &str) -> ConnectionConfig {
    ConnectionConfig::builder(BackendKind::KeyValue)
        .name(name)
        .host("cache.internal")
        .build()
        .unwrap()
}

// ========== Key scanning ==========

/// `*` and `?` glob matching, as Redis `MATCH` does for plain patterns.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    fn go(p: &[char], k: &[char]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some('*'), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some('?'), Some(_)) => go(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    go(&p, &k)
}

/// In-memory keyspace answering `SCAN` rounds.
///
/// The server cursor is an index into the key list; each round looks at
/// `batch_size` keys regardless of the requested count, like a server that
/// treats COUNT as a hint.
pub struct MemoryScanner {
    keys: Vec<String>,
    batch: usize,
    rounds: usize,
}

impl MemoryScanner {
    pub fn with_keys(keys: impl IntoIterator<Item = String>) -> Self {
        Self { keys: keys.into_iter().collect(), batch: 10, rounds: 0 }
    }

    pub fn batch_size(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Scan rounds served so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }
}

#[async_trait]
impl KeyScanner for MemoryScanner {
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        _count: usize,
    ) -> QuarryResult<(u64, Vec<String>)> {
        self.rounds += 1;
        let start = (cursor as usize).min(self.keys.len());
        let end = (start + self.batch).min(self.keys.len());
        let batch =
            self.keys[start..end].iter().filter(|k| glob_match(pattern, k)).cloned().collect();
        let next = if end >= self.keys.len() { 0 } else { end as u64 };
        Ok((next, batch))
    }
}

// ========== Backend ==========

#[derive(Debug, Clone)]
struct StoredKey {
    key_type: KeyType,
    value: Value,
    ttl: i64,
}

/// State shared by every fake adapter and tunnel of one connector.
pub struct FakeBackend {
    healthy: AtomicBool,
    broken: AtomicBool,
    pings: AtomicUsize,
    calls: AtomicUsize,
    live: AtomicUsize,
    journal: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
    keys: Mutex<BTreeMap<String, StoredKey>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            journal: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            keys: Mutex::new(BTreeMap::new()),
        }
    }
}

impl FakeBackend {
    /// Make pings fail (`false`) or succeed.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make every data call fail with a transport error.
    pub fn break_transport(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Adapter calls that would have reached the backend.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Adapters opened and not yet closed.
    pub fn live_adapters(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn seed_keys(&self, keys: impl IntoIterator<Item = String>) {
        let mut store = self.keys.lock();
        for key in keys {
            let stored = StoredKey {
                key_type: KeyType::String,
                value: Value::String(key.clone()),
                ttl: NO_EXPIRY,
            };
            store.insert(key, stored);
        }
    }

    fn call(&self) -> QuarryResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(QuarryError::network("connection reset by peer"));
        }
        Ok(())
    }

    fn store(&self, key: &str, key_type: KeyType, value: Value, ttl: Option<i64>) {
        let ttl = effective_ttl(ttl).map_or(NO_EXPIRY, |t| t as i64);
        self.keys.lock().insert(key.to_string(), StoredKey { key_type, value, ttl });
    }
}

fn user_rows() -> Vec<Value> {
    (1..=12).map(|id| json!({ "id": id, "name": format!("user{id}") })).collect()
}

/// Understands `id = N` filters only.
fn matches_filter(row: &Value, filter: Option<&str>) -> bool {
    let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return true;
    };
    match filter.strip_prefix("id").map(str::trim).and_then(|f| f.strip_prefix('=')) {
        Some(value) => value.trim().parse::<i64>().ok() == row["id"].as_i64(),
        None => false,
    }
}

// ========== Adapter ==========

pub struct FakeAdapter {
    id: Uuid,
    kind: BackendKind,
    backend: Arc<FakeBackend>,
    closed: AtomicBool,
}

#[async_trait]
impl DatabaseAdapter for FakeAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn ping(&self) -> QuarryResult<()> {
        self.backend.pings.fetch_add(1, Ordering::SeqCst);
        if self.backend.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QuarryError::network("ping timed out"))
        }
    }

    async fn list_tables(&self) -> QuarryResult<Vec<TableInfo>> {
        self.backend.call()?;
        Ok(vec![TableInfo::new("public", "users", "table")])
    }

    async fn get_table_structure(
        &self,
        _schema: &str,
        _table: &str,
    ) -> QuarryResult<TableStructure> {
        self.backend.call()?;
        Ok(TableStructure {
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                    default: None,
                    primary_key: true,
                },
                ColumnInfo {
                    name: "name".into(),
                    data_type: "text".into(),
                    nullable: true,
                    default: None,
                    primary_key: false,
                },
            ],
            indexes: vec![IndexInfo {
                name: "users_pkey".into(),
                columns: vec!["id".into()],
                unique: true,
                primary: true,
            }],
            foreign_keys: vec![],
        })
    }

    async fn get_table_data(&self, req: &TableDataRequest) -> QuarryResult<TableData> {
        self.backend.call()?;
        let mut rows: Vec<Value> =
            user_rows().into_iter().filter(|r| matches_filter(r, req.filter.as_deref())).collect();
        if req.sort_direction == SortDirection::Desc {
            rows.reverse();
        }
        let total = rows.len() as i64;
        let data = rows
            .into_iter()
            .skip(req.offset() as usize)
            .take(req.effective_limit() as usize)
            .collect();
        Ok(TableData { data, total, page: req.effective_page(), limit: req.effective_limit() })
    }

    async fn execute_query(&self, query: &str) -> QuarryResult<QueryResult> {
        self.backend.call()?;
        self.backend.executed.lock().push(query.to_string());
        if query.contains("1/0") {
            return Ok(QueryResult::failed("division by zero", 1));
        }
        Ok(QueryResult::rows(vec![json!({ "?column?": 1 })], 1))
    }

    async fn schema_overview(&self) -> QuarryResult<SchemaOverview> {
        let structure = self.get_table_structure("public", "users").await?;
        Ok(SchemaOverview {
            tables: vec![TableWithStructure::from_parts(
                TableInfo::new("public", "users", "table"),
                structure,
            )],
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.backend.live.fetch_sub(1, Ordering::SeqCst);
        self.backend.journal.lock().push(format!("adapter:{}", self.id));
    }

    fn as_key_value(&self) -> Option<&dyn KeyValueAdapter> {
        (self.kind == BackendKind::KeyValue).then_some(self as &dyn KeyValueAdapter)
    }
}

#[async_trait]
impl KeyValueAdapter for FakeAdapter {
    async fn search_keys(
        &self,
        pattern: &str,
        limit: usize,
        cursor: &str,
    ) -> QuarryResult<KeySearchPage> {
        self.backend.call()?;
        let store = self.backend.keys.lock().clone();
        let pattern = if pattern.is_empty() { "*" } else { pattern };
        let mut scanner = MemoryScanner::with_keys(store.keys().cloned()).batch_size(25);
        let page = scan::collect_page(&mut scanner, pattern, limit, cursor).await?;

        let keys: Vec<KeyInfo> = page
            .keys
            .into_iter()
            .filter_map(|key| {
                let stored = store.get(&key)?;
                Some(KeyInfo { key, key_type: stored.key_type, ttl: stored.ttl, size: None })
            })
            .collect();
        Ok(KeySearchPage {
            total: keys.len() as i64,
            keys,
            cursor: page.cursor.to_string(),
            scan_complete: page.complete,
        })
    }

    async fn get_key_details(&self, key: &str) -> QuarryResult<KeyDetails> {
        self.backend.call()?;
        let stored = self
            .backend
            .keys
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| QuarryError::not_found(format!("Key '{key}' does not exist")))?;
        Ok(KeyDetails {
            key: key.to_string(),
            key_type: stored.key_type,
            ttl: stored.ttl,
            value: stored.value,
            encoding: None,
            size: None,
            length: None,
        })
    }

    async fn set_key(&self, key: &str, value: &str, ttl: Option<i64>) -> QuarryResult<()> {
        self.backend.call()?;
        self.backend.store(key, KeyType::String, Value::String(value.to_string()), ttl);
        Ok(())
    }

    async fn set_list(&self, key: &str, values: &[String], ttl: Option<i64>) -> QuarryResult<()> {
        self.backend.call()?;
        self.backend.keys.lock().remove(key);
        if !values.is_empty() {
            self.backend.store(key, KeyType::List, json!(values), ttl);
        }
        Ok(())
    }

    async fn set_set(&self, key: &str, members: &[String], ttl: Option<i64>) -> QuarryResult<()> {
        self.backend.call()?;
        self.backend.keys.lock().remove(key);
        if !members.is_empty() {
            self.backend.store(key, KeyType::Set, json!(members), ttl);
        }
        Ok(())
    }

    async fn set_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        self.backend.call()?;
        self.backend.keys.lock().remove(key);
        if !fields.is_empty() {
            self.backend.store(key, KeyType::Hash, json!(fields), ttl);
        }
        Ok(())
    }

    async fn set_zset(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        self.backend.call()?;
        self.backend.keys.lock().remove(key);
        if !members.is_empty() {
            let pairs: Vec<Value> = members.iter().map(|(m, s)| json!([m, s])).collect();
            self.backend.store(key, KeyType::ZSet, Value::Array(pairs), ttl);
        }
        Ok(())
    }

    async fn update_ttl(&self, key: &str, ttl: Option<i64>) -> QuarryResult<()> {
        self.backend.call()?;
        let mut store = self.backend.keys.lock();
        let stored = store
            .get_mut(key)
            .ok_or_else(|| QuarryError::not_found(format!("Key '{key}' does not exist")))?;
        stored.ttl = effective_ttl(ttl).map_or(NO_EXPIRY, |t| t as i64);
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> QuarryResult<bool> {
        self.backend.call()?;
        Ok(self.backend.keys.lock().remove(key).is_some())
    }
}

// ========== Tunnel ==========

pub struct FakeTunnel {
    id: Uuid,
    backend: Arc<FakeBackend>,
    closed: AtomicBool,
}

#[async_trait]
impl TunnelHandle for FakeTunnel {
    fn local_port(&self) -> u16 {
        40_000
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.journal.lock().push(format!("tunnel:{}", self.id));
        }
    }
}

// ========== Connector ==========

#[derive(Default)]
pub struct FakeConnector {
    backend: Arc<FakeBackend>,
    dials: AtomicUsize,
    tunnels: AtomicUsize,
    fail_dials: AtomicUsize,
    fail_tunnels: AtomicUsize,
    dial_delay: Option<Duration>,
    endpoints: Mutex<Vec<Endpoint>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each adapter dial open for `delay`.
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = Some(delay);
        self
    }

    pub fn fail_next_dials(&self, n: usize) {
        self.fail_dials.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_tunnels(&self, n: usize) {
        self.fail_tunnels.store(n, Ordering::SeqCst);
    }

    pub fn backend(&self) -> &Arc<FakeBackend> {
        &self.backend
    }

    /// Adapter dials attempted, successful or not.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    /// Endpoints adapters were asked to dial.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().clone()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open_tunnel(
        &self,
        config: &ConnectionConfig,
    ) -> QuarryResult<Option<Box<dyn TunnelHandle>>> {
        if config.ssh_tunnel.is_none() {
            return Ok(None);
        }
        self.tunnels.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_tunnels) {
            return Err(QuarryError::tunnel(
                "SSH authentication failed for deploy@bastion.internal",
            ));
        }
        Ok(Some(Box::new(FakeTunnel {
            id: config.id,
            backend: Arc::clone(&self.backend),
            closed: AtomicBool::new(false),
        })))
    }

    async fn open_adapter(
        &self,
        config: &ConnectionConfig,
        endpoint: Endpoint,
    ) -> QuarryResult<Box<dyn DatabaseAdapter>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().push(endpoint);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.fail_dials) {
            return Err(QuarryError::network_with_hint(
                "Connection refused",
                "Check that the server is running",
            ));
        }
        self.backend.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeAdapter {
            id: config.id,
            kind: config.kind,
            backend: Arc::clone(&self.backend),
            closed: AtomicBool::new(false),
        }))
    }
}
