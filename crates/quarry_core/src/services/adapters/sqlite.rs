//! SQLite adapter.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool with the
//! connection behind a mutex. The schema is always `main`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ColumnInfo, ConnectionConfig, ForeignKeyInfo, IndexInfo, QueryResult,
    SchemaOverview, TableData, TableDataRequest, TableInfo, TableStructure, TableWithStructure,
};
use crate::services::adapter::DatabaseAdapter;
use crate::services::statements;

/// Schema name reported for every SQLite table.
pub const SQLITE_SCHEMA: &str = "main";

const TABLES_QUERY: &str = "SELECT name, type FROM sqlite_master \
     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// Live SQLite session.
pub struct SqliteAdapter {
    id: Uuid,
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteAdapter {
    /// Open (creating if needed) the configured database file.
    pub async fn open(config: &ConnectionConfig) -> QuarryResult<Self> {
        let path = config
            .file_path
            .clone()
            .ok_or_else(|| {
                QuarryError::validation("File path is required for SQLite connections")
            })?;

        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI;
            let conn = Connection::open_with_flags(&open_path, flags)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| QuarryError::internal(format!("SQLite open task failed: {e}")))?
        .map_err(|e| {
            QuarryError::network_with_hint(
                format!("Failed to open SQLite database '{}': {e}", path.display()),
                "Check that the file path exists and is readable",
            )
        })?;

        tracing::info!(
            connection_id = %config.id,
            path = %path.display(),
            "SQLite database opened"
        );

        Ok(Self { id: config.id, path, conn: Arc::new(Mutex::new(Some(conn))) })
    }

    async fn with_conn<T, F>(&self, f: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> QuarryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard
                .as_mut()
                .ok_or_else(|| QuarryError::network("SQLite database is closed"))?;
            f(conn)
        })
        .await
        .map_err(|e| QuarryError::internal(format!("SQLite task failed: {e}")))?
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("[{} bytes]", bytes.len())),
    }
}

fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<Value>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            object.insert(name.clone(), value_to_json(row.get_ref(i)?));
        }
        out.push(Value::Object(object));
    }
    Ok(out)
}

fn run_statement(
    conn: &Connection,
    query: &str,
    started: Instant,
) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(query)?;
    if stmt.column_count() == 0 {
        let affected = stmt.execute([])?;
        return Ok(QueryResult::affected(affected as i64, started.elapsed().as_millis() as u64));
    }
    let rows = collect_rows(&mut stmt, [])?;
    Ok(QueryResult::rows(rows, started.elapsed().as_millis() as u64))
}

fn table_structure(conn: &Connection, table: &str) -> rusqlite::Result<TableStructure> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                data_type: row.get::<_, String>(1)?.to_uppercase(),
                nullable: row.get::<_, i64>(2)? == 0,
                default: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? > 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn
        .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1) ORDER BY name")?;
    let index_rows = stmt
        .query_map([table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let mut indexes = Vec::with_capacity(index_rows.len());
    for (name, unique, origin) in index_rows {
        let columns = info
            .query_map([&name], |row| row.get::<_, Option<String>>(0))?
            .filter_map(|c| c.transpose())
            .collect::<rusqlite::Result<Vec<_>>>()?;
        indexes.push(IndexInfo { name, columns, unique: unique == 1, primary: origin == "pk" });
    }

    let mut stmt = conn.prepare(
        "SELECT id, \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let foreign_keys = stmt
        .query_map([table], |row| {
            Ok(ForeignKeyInfo {
                name: format!("fk_{}", row.get::<_, i64>(0)?),
                column: row.get(1)?,
                references_table: row.get(2)?,
                references_column: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(TableStructure { columns, indexes, foreign_keys })
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare(TABLES_QUERY)?;
    let tables = stmt
        .query_map([], |row| {
            Ok(TableInfo::new(SQLITE_SCHEMA, row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::FileBased
    }

    async fn ping(&self) -> QuarryResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn list_tables(&self) -> QuarryResult<Vec<TableInfo>> {
        self.with_conn(|conn| Ok(list_tables(conn)?)).await
    }

    async fn get_table_structure(
        &self,
        _schema: &str,
        table: &str,
    ) -> QuarryResult<TableStructure> {
        let table = table.to_string();
        self.with_conn(move |conn| Ok(table_structure(conn, &table)?)).await
    }

    async fn get_table_data(&self, req: &TableDataRequest) -> QuarryResult<TableData> {
        let req = req.clone();
        self.with_conn(move |conn| {
            let table = statements::table_ref(BackendKind::FileBased, &req.schema, &req.table);
            let total: i64 =
                conn.query_row(&statements::count_statement(&table, &req), [], |row| row.get(0))?;
            let mut stmt = conn.prepare(&statements::page_statement(&table, &req))?;
            let data = collect_rows(&mut stmt, [])?;
            Ok(TableData { data, total, page: req.effective_page(), limit: req.effective_limit() })
        })
        .await
    }

    async fn execute_query(&self, query: &str) -> QuarryResult<QueryResult> {
        let query = statements::check_query_text(query)?.to_string();
        let id = self.id;
        self.with_conn(move |conn| {
            let started = Instant::now();
            match run_statement(conn, &query, started) {
                Ok(result) => Ok(result),
                Err(e) => {
                    let err = QuarryError::from(e);
                    if err.is_connection_failure() {
                        return Err(err);
                    }
                    tracing::debug!(connection_id = %id, error = %err, "Statement failed");
                    Ok(QueryResult::failed(err.to_string(), started.elapsed().as_millis() as u64))
                }
            }
        })
        .await
    }

    async fn schema_overview(&self) -> QuarryResult<SchemaOverview> {
        self.with_conn(|conn| {
            // One read transaction keeps every pragma on the same snapshot.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let mut tables = Vec::new();
            for table in list_tables(&tx)? {
                let structure = table_structure(&tx, &table.name)?;
                tables.push(TableWithStructure::from_parts(table, structure));
            }
            tx.finish()?;
            Ok(SchemaOverview { tables })
        })
        .await
    }

    async fn close(&self) {
        let conn = Arc::clone(&self.conn);
        let taken = conn.lock().take();
        if let Some(conn) = taken {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(
                    connection_id = %self.id,
                    error = %e,
                    "SQLite close reported an error"
                );
            }
            tracing::debug!(
                connection_id = %self.id,
                path = %self.path.display(),
                "SQLite database closed"
            );
        }
    }
}
