//! Redis adapter.
//!
//! Redis has no tables, so the relational surface is a single synthetic
//! `redis.keys` keyspace entry and the real work happens through
//! [`KeyValueAdapter`].

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    effective_ttl, BackendKind, ConnectionConfig, KeyDetails, KeyInfo, KeySearchPage, KeyType,
    QueryResult, RowDelete, RowInsert, RowUpdate, SchemaOverview, TableData, TableDataRequest,
    TableInfo, TableStructure, TableWithStructure, NO_EXPIRY,
};
use crate::services::adapter::{DatabaseAdapter, Endpoint, KeyValueAdapter};
use crate::services::scan::{collect_page, KeyScanner};
use crate::services::statements;

const STREAM_PLACEHOLDER: &str = "<stream data - use XREAD command>";

/// Live Redis session over one multiplexed connection.
pub struct RedisAdapter {
    id: Uuid,
    conn: RwLock<Option<MultiplexedConnection>>,
}

/// Connection parameters for `config` dialed at `endpoint`.
pub(crate) fn connection_info(config: &ConnectionConfig, endpoint: &Endpoint) -> ConnectionInfo {
    let addr = if config.tls {
        ConnectionAddr::TcpTls {
            host: endpoint.host.clone(),
            port: endpoint.port,
            insecure: true,
            tls_params: None,
        }
    } else {
        ConnectionAddr::Tcp(endpoint.host.clone(), endpoint.port)
    };

    ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db: config.database.trim().parse().unwrap_or(0),
            username: Some(config.username.clone()).filter(|u| !u.is_empty()),
            password: config.password.clone().filter(|p| !p.is_empty()),
            ..Default::default()
        },
    }
}

impl RedisAdapter {
    /// Dial and verify with `PING`.
    pub async fn connect(config: &ConnectionConfig, endpoint: &Endpoint) -> QuarryResult<Self> {
        let client = redis::Client::open(connection_info(config, endpoint))?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            tracing::warn!(connection_id = %config.id, reply = %pong, "Unexpected PING reply");
        }

        tracing::info!(
            connection_id = %config.id,
            host = %endpoint.host,
            port = endpoint.port,
            tls = config.tls,
            "Redis connection established"
        );

        Ok(Self { id: config.id, conn: RwLock::new(Some(conn)) })
    }

    fn conn(&self) -> QuarryResult<MultiplexedConnection> {
        self.conn.read().clone().ok_or_else(|| QuarryError::network("Redis connection is closed"))
    }
}

/// Render a reply as JSON.
pub(crate) fn value_to_json(value: &redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Okay => json!("OK"),
        redis::Value::SimpleString(s) => json!(s),
        redis::Value::BulkString(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => json!(s),
            Err(_) => json!(format!("<binary data: {} bytes>", bytes.len())),
        },
        redis::Value::Int(i) => json!(i),
        redis::Value::Double(d) => json!(d),
        redis::Value::Boolean(b) => json!(b),
        redis::Value::VerbatimString { text, .. } => json!(text),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::Array(items.iter().map(value_to_json).collect())
        }
        redis::Value::Map(pairs) => {
            let object: Map<String, Value> = pairs
                .iter()
                .filter_map(|(k, v)| match k {
                    redis::Value::BulkString(bytes) => {
                        String::from_utf8(bytes.clone()).ok().map(|key| (key, value_to_json(v)))
                    }
                    redis::Value::SimpleString(key) => Some((key.clone(), value_to_json(v))),
                    _ => None,
                })
                .collect();
            Value::Object(object)
        }
        _ => json!("<unknown type>"),
    }
}

struct RedisScanner {
    conn: MultiplexedConnection,
}

#[async_trait]
impl KeyScanner for RedisScanner {
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> QuarryResult<(u64, Vec<String>)> {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await?;
        Ok((next, keys))
    }
}

/// Zip keys with their `TYPE`, `TTL` and optional `MEMORY USAGE` replies.
fn key_infos(keys: Vec<String>, replies: &[redis::Value], with_size: bool) -> Vec<KeyInfo> {
    let stride = if with_size { 3 } else { 2 };
    keys.into_iter()
        .zip(replies.chunks(stride))
        .map(|(key, reply)| {
            let key_type = redis::from_redis_value::<String>(&reply[0])
                .map(|t| KeyType::from_type_reply(&t))
                .unwrap_or(KeyType::None);
            let ttl = redis::from_redis_value::<i64>(&reply[1]).unwrap_or(NO_EXPIRY);
            let size = if with_size {
                redis::from_redis_value::<Option<u64>>(&reply[2]).ok().flatten()
            } else {
                None
            };
            KeyInfo { key, key_type, ttl, size }
        })
        .collect()
}

async fn enrich(conn: &mut MultiplexedConnection, keys: Vec<String>) -> QuarryResult<Vec<KeyInfo>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let mut pipe = redis::pipe();
    for key in &keys {
        pipe.cmd("TYPE").arg(key).cmd("TTL").arg(key).cmd("MEMORY").arg("USAGE").arg(key);
    }
    match pipe.query_async::<Vec<redis::Value>>(conn).await {
        Ok(replies) => return Ok(key_infos(keys, &replies, true)),
        Err(e) => {
            let err = QuarryError::from(e);
            if err.is_connection_failure() {
                return Err(err);
            }
            // MEMORY USAGE can be disabled or renamed on managed servers.
            tracing::debug!(error = %err, "Key enrichment without MEMORY USAGE");
        }
    }

    let mut pipe = redis::pipe();
    for key in &keys {
        pipe.cmd("TYPE").arg(key).cmd("TTL").arg(key);
    }
    let replies: Vec<redis::Value> = pipe.query_async(conn).await?;
    Ok(key_infos(keys, &replies, false))
}

async fn run_command(
    conn: &mut MultiplexedConnection,
    parts: &[&str],
) -> redis::RedisResult<Value> {
    let mut cmd = redis::cmd(parts[0]);
    for part in &parts[1..] {
        cmd.arg(*part);
    }
    if parts[0].eq_ignore_ascii_case("INFO") {
        let info: String = cmd.query_async(conn).await?;
        return Ok(json!({ "info": info }));
    }
    let reply: redis::Value = cmd.query_async(conn).await?;
    Ok(value_to_json(&reply))
}

#[async_trait]
impl DatabaseAdapter for RedisAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    async fn ping(&self) -> QuarryResult<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_tables(&self) -> QuarryResult<Vec<TableInfo>> {
        Ok(vec![TableInfo::new("redis", "keys", "keyspace")])
    }

    async fn get_table_structure(
        &self,
        _schema: &str,
        _table: &str,
    ) -> QuarryResult<TableStructure> {
        Ok(TableStructure::default())
    }

    async fn get_table_data(&self, req: &TableDataRequest) -> QuarryResult<TableData> {
        Ok(req.empty_page())
    }

    async fn execute_query(&self, query: &str) -> QuarryResult<QueryResult> {
        let query = statements::check_query_text(query)?;
        let mut conn = self.conn()?;
        let parts: Vec<&str> = query.split_whitespace().collect();
        let started = Instant::now();

        match run_command(&mut conn, &parts).await {
            Ok(row) => Ok(QueryResult::rows(vec![row], started.elapsed().as_millis() as u64)),
            Err(e) => {
                let err = QuarryError::from(e);
                if err.is_connection_failure() {
                    return Err(err);
                }
                Ok(QueryResult::failed(
                    format!("Redis command failed: {err}"),
                    started.elapsed().as_millis() as u64,
                ))
            }
        }
    }

    async fn schema_overview(&self) -> QuarryResult<SchemaOverview> {
        let tables = self
            .list_tables()
            .await?
            .into_iter()
            .map(|t| TableWithStructure::from_parts(t, TableStructure::default()))
            .collect();
        Ok(SchemaOverview { tables })
    }

    async fn insert_row(&self, _req: &RowInsert) -> QuarryResult<QueryResult> {
        Err(QuarryError::unsupported("pool_insert_table_row", self.kind()))
    }

    async fn update_row(&self, _req: &RowUpdate) -> QuarryResult<QueryResult> {
        Err(QuarryError::unsupported("pool_update_table_row", self.kind()))
    }

    async fn delete_row(&self, _req: &RowDelete) -> QuarryResult<QueryResult> {
        Err(QuarryError::unsupported("pool_delete_table_row", self.kind()))
    }

    async fn close(&self) {
        if self.conn.write().take().is_some() {
            tracing::debug!(connection_id = %self.id, "Redis connection closed");
        }
    }

    fn as_key_value(&self) -> Option<&dyn KeyValueAdapter> {
        Some(self)
    }
}

#[async_trait]
impl KeyValueAdapter for RedisAdapter {
    async fn search_keys(
        &self,
        pattern: &str,
        limit: usize,
        cursor: &str,
    ) -> QuarryResult<KeySearchPage> {
        let pattern = if pattern.trim().is_empty() { "*" } else { pattern };
        let mut scanner = RedisScanner { conn: self.conn()? };
        let page = collect_page(&mut scanner, pattern, limit, cursor).await?;
        let keys = enrich(&mut scanner.conn, page.keys).await?;

        Ok(KeySearchPage {
            total: keys.len() as i64,
            keys,
            cursor: page.cursor.to_string(),
            scan_complete: page.complete,
        })
    }

    async fn get_key_details(&self, key: &str) -> QuarryResult<KeyDetails> {
        let mut conn = self.conn()?;

        let exists: bool = conn.exists(key).await?;
        if !exists {
            return Err(QuarryError::not_found(format!("Key '{key}' does not exist")));
        }

        let type_reply: String = conn.key_type(key).await?;
        let key_type = KeyType::from_type_reply(&type_reply);
        let ttl: i64 = conn.ttl(key).await?;

        let value = match key_type {
            KeyType::String => {
                let v: redis::Value = conn.get(key).await?;
                value_to_json(&v)
            }
            KeyType::List => {
                let v: redis::Value = conn.lrange(key, 0, -1).await?;
                value_to_json(&v)
            }
            KeyType::Set => {
                let v: redis::Value = conn.smembers(key).await?;
                value_to_json(&v)
            }
            KeyType::ZSet => {
                let members: Vec<(String, f64)> = conn.zrange_withscores(key, 0, -1).await?;
                json!(members)
            }
            KeyType::Hash => {
                let fields: BTreeMap<String, String> = conn.hgetall(key).await?;
                json!(fields)
            }
            KeyType::Stream => json!(STREAM_PLACEHOLDER),
            KeyType::None | KeyType::Unknown => Value::Null,
        };

        let length: Option<u64> = match key_type {
            KeyType::String => conn.strlen(key).await.ok(),
            KeyType::List => conn.llen(key).await.ok(),
            KeyType::Set => conn.scard(key).await.ok(),
            KeyType::ZSet => conn.zcard(key).await.ok(),
            KeyType::Hash => conn.hlen(key).await.ok(),
            _ => None,
        };

        let size: Option<u64> = redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(key)
            .query_async::<Option<u64>>(&mut conn)
            .await
            .ok()
            .flatten();
        let encoding: Option<String> = redis::cmd("OBJECT")
            .arg("ENCODING")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .ok()
            .flatten();

        Ok(KeyDetails { key: key.to_string(), key_type, ttl, value, encoding, size, length })
    }

    async fn set_key(&self, key: &str, value: &str, ttl: Option<i64>) -> QuarryResult<()> {
        let mut conn = self.conn()?;
        match effective_ttl(ttl) {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_list(&self, key: &str, values: &[String], ttl: Option<i64>) -> QuarryResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !values.is_empty() {
            pipe.rpush(key, values).ignore();
        }
        self.replace(pipe, key, !values.is_empty(), ttl).await
    }

    async fn set_set(&self, key: &str, members: &[String], ttl: Option<i64>) -> QuarryResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            pipe.sadd(key, members).ignore();
        }
        self.replace(pipe, key, !members.is_empty(), ttl).await
    }

    async fn set_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            let pairs: Vec<(&str, &str)> =
                fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            pipe.hset_multiple(key, &pairs).ignore();
        }
        self.replace(pipe, key, !fields.is_empty(), ttl).await
    }

    async fn set_zset(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            let scored: Vec<(f64, &str)> = members.iter().map(|(m, s)| (*s, m.as_str())).collect();
            pipe.zadd_multiple(key, &scored).ignore();
        }
        self.replace(pipe, key, !members.is_empty(), ttl).await
    }

    async fn update_ttl(&self, key: &str, ttl: Option<i64>) -> QuarryResult<()> {
        let mut conn = self.conn()?;
        let exists: bool = conn.exists(key).await?;
        if !exists {
            return Err(QuarryError::not_found(format!("Key '{key}' does not exist")));
        }
        match effective_ttl(ttl) {
            Some(secs) => conn.expire::<_, ()>(key, secs as i64).await?,
            None => conn.persist::<_, ()>(key).await?,
        }
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> QuarryResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

impl RedisAdapter {
    /// Run a `MULTI` replace pipeline, adding `EXPIRE` when the key was written.
    async fn replace(
        &self,
        mut pipe: redis::Pipeline,
        key: &str,
        written: bool,
        ttl: Option<i64>,
    ) -> QuarryResult<()> {
        if let (true, Some(secs)) = (written, effective_ttl(ttl)) {
            pipe.expire(key, secs as i64).ignore();
        }
        let mut conn = self.conn()?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
