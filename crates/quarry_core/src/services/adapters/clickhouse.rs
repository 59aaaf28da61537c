//! ClickHouse adapter over the HTTP interface.
//!
//! Every call is a `POST` with the statement as body. Reads are asked for
//! `JSONEachRow` so each response line is one row object. Introspection
//! binds user input through ClickHouse query parameters (`{name:String}` with
//! a `param_name` URL argument) instead of splicing it into SQL.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ColumnInfo, ConnectionConfig, IndexInfo, QueryResult, SchemaOverview, TableData,
    TableDataRequest, TableInfo, TableStructure, TableWithStructure,
};
use crate::services::adapter::{DatabaseAdapter, Endpoint};
use crate::services::statements;

const LIST_TABLES_QUERY: &str = "SELECT database, name, engine FROM system.tables \
     WHERE database = currentDatabase() ORDER BY name";

const COLUMNS_QUERY: &str = "SELECT name, type, default_kind, default_expression, \
     is_in_primary_key FROM system.columns \
     WHERE database = currentDatabase() AND table = {table:String} \
     ORDER BY position";

const INDEXES_QUERY: &str = "SELECT name, expr, type FROM system.data_skipping_indices \
     WHERE database = currentDatabase() AND table = {table:String}";

/// Columns and skipping indices of every table, joined server-side so one
/// statement sees one snapshot of the system tables.
const SCHEMA_OVERVIEW_QUERY: &str = r#"
SELECT
    c.schema AS schema,
    c.name AS name,
    c.engine AS type,
    c.columns_raw AS columns_raw,
    i.indexes_raw AS indexes_raw
FROM
(
    SELECT
        sc.database AS schema,
        sc.table AS name,
        st.engine AS engine,
        groupArray(tuple(
            sc.name, sc.type, sc.default_kind, sc.default_expression, sc.is_in_primary_key
        )) AS columns_raw
    FROM system.columns sc
    JOIN system.tables st ON sc.database = st.database AND sc.table = st.name
    WHERE sc.database = currentDatabase()
    GROUP BY sc.database, sc.table, st.engine
) AS c
LEFT JOIN
(
    SELECT database, table, groupArray(tuple(name, expr, type)) AS indexes_raw
    FROM system.data_skipping_indices
    WHERE database = currentDatabase()
    GROUP BY database, table
) AS i ON c.schema = i.database AND c.name = i.table
ORDER BY c.name
"#;

const READ_KEYWORDS: [&str; 5] = ["SELECT", "SHOW", "DESCRIBE", "WITH", "EXISTS"];

/// ClickHouse session: an HTTP client bound to one server and database.
pub struct ClickhouseAdapter {
    id: Uuid,
    url: String,
    database: String,
    username: String,
    password: String,
    client: RwLock<Option<reqwest::Client>>,
}

/// Whether the statement returns rows.
pub(crate) fn is_read_statement(query: &str) -> bool {
    query
        .split_whitespace()
        .next()
        .map(|word| READ_KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k)))
        .unwrap_or(false)
}

/// Trim a trailing `;` and request `JSONEachRow` for reads without a FORMAT clause.
pub(crate) fn prepare_statement(query: &str) -> String {
    let cleaned = query.trim().trim_end_matches(';').trim_end();
    let has_format = cleaned.split_whitespace().any(|w| w.eq_ignore_ascii_case("FORMAT"));
    if is_read_statement(cleaned) && !has_format {
        format!("{cleaned} FORMAT JSONEachRow")
    } else {
        cleaned.to_string()
    }
}

fn parse_rows(body: &str) -> Vec<Value> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping non-JSON response line");
                None
            }
        })
        .collect()
}

/// First column of the first row as a count. 64-bit integers arrive quoted.
fn parse_count(rows: &[Value]) -> QuarryResult<i64> {
    rows.first()
        .and_then(|row| row.as_object())
        .and_then(|obj| obj.values().next())
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .ok_or_else(|| {
            QuarryError::query(format!("Unexpected COUNT response: {}", Value::from(rows.to_vec())))
        })
}

/// Tuples of a `groupArray(tuple(..))` column with at least `arity` fields.
fn tuples(value: &Value, arity: usize) -> impl Iterator<Item = &Vec<Value>> {
    value
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_array)
        .filter(move |t| t.len() >= arity)
}

/// One table per overview row. A table without skipping indices carries an
/// empty `indexes_raw`.
fn overview_from_rows(rows: &[Value]) -> SchemaOverview {
    let tables = rows
        .iter()
        .map(|row| {
            let info = TableInfo::new(text(&row["schema"]), text(&row["name"]), text(&row["type"]));
            let columns = tuples(&row["columns_raw"], 5)
                .map(|t| column_from_parts(&t[0], &t[1], &t[2], &t[3], &t[4]))
                .collect();
            let indexes =
                tuples(&row["indexes_raw"], 3).map(|t| index_from_parts(&t[0], &t[1])).collect();
            TableWithStructure::from_parts(
                info,
                TableStructure { columns, indexes, foreign_keys: Vec::new() },
            )
        })
        .collect();
    SchemaOverview { tables }
}

fn backtick(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn text(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

fn column_from_parts(
    name: &Value,
    data_type: &Value,
    kind: &Value,
    expr: &Value,
    pk: &Value,
) -> ColumnInfo {
    let data_type = text(data_type);
    let expr = text(expr);
    ColumnInfo {
        name: text(name),
        nullable: data_type.starts_with("Nullable"),
        data_type,
        default: (!expr.is_empty()).then(|| format!("{} {}", text(kind), expr)),
        primary_key: pk.as_u64().unwrap_or(0) == 1,
    }
}

/// ClickHouse names its stock database and user `default`.
fn or_default_name(value: &str) -> String {
    if value.is_empty() {
        "default".to_string()
    } else {
        value.to_string()
    }
}

fn index_from_parts(name: &Value, expr: &Value) -> IndexInfo {
    IndexInfo { name: text(name), columns: vec![text(expr)], unique: false, primary: false }
}

impl ClickhouseAdapter {
    /// Build the client and verify with `SELECT 1`.
    pub async fn connect(config: &ConnectionConfig, endpoint: &Endpoint) -> QuarryResult<Self> {
        let scheme = if config.tls { "https" } else { "http" };
        let connect_timeout = u64::from(config.options.connect_timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .build()
            .map_err(|e| QuarryError::internal(format!("Failed to build HTTP client: {e}")))?;

        let adapter = Self {
            id: config.id,
            url: format!("{scheme}://{}:{}/", endpoint.host, endpoint.port),
            database: or_default_name(&config.database),
            username: or_default_name(&config.username),
            password: config.password.clone().unwrap_or_default(),
            client: RwLock::new(Some(client)),
        };

        adapter.fetch("SELECT 1", &[]).await?;
        tracing::info!(
            connection_id = %config.id,
            url = %adapter.url,
            database = %adapter.database,
            "ClickHouse connection established"
        );
        Ok(adapter)
    }

    /// POST one statement. A non-2xx reply becomes a statement error.
    async fn post(&self, body: String, params: &[(&str, &str)]) -> QuarryResult<String> {
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| QuarryError::network("ClickHouse connection is closed"))?;

        let response = client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("database", self.database.as_str())])
            .query(params)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let code = response
            .headers()
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = response.text().await?;

        if status.is_success() {
            return Ok(text);
        }
        let message = text.trim().to_string();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(QuarryError::authentication(message));
        }
        Err(QuarryError::Query { message, detail: None, hint: None, position: None, code })
    }

    /// Run a read and parse its rows.
    async fn fetch(&self, query: &str, params: &[(&str, &str)]) -> QuarryResult<Vec<Value>> {
        let body = self.post(prepare_statement(query), params).await?;
        Ok(parse_rows(&body))
    }

    async fn run(&self, query: &str) -> QuarryResult<QueryResult> {
        let started = Instant::now();
        if is_read_statement(query) {
            let rows = self.fetch(query, &[]).await?;
            return Ok(QueryResult::rows(rows, started.elapsed().as_millis() as u64));
        }
        self.post(prepare_statement(query), &[]).await?;
        Ok(QueryResult {
            data: vec![serde_json::json!({ "result": "Query executed successfully" })],
            row_count: 0,
            error: None,
            time_taken_ms: Some(started.elapsed().as_millis() as u64),
        })
    }
}

#[async_trait]
impl DatabaseAdapter for ClickhouseAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::ColumnStore
    }

    async fn ping(&self) -> QuarryResult<()> {
        self.fetch("SELECT 1", &[]).await.map(|_| ())
    }

    async fn list_tables(&self) -> QuarryResult<Vec<TableInfo>> {
        let rows = self.fetch(LIST_TABLES_QUERY, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                TableInfo::new(text(&row["database"]), text(&row["name"]), text(&row["engine"]))
            })
            .collect())
    }

    async fn get_table_structure(
        &self,
        _schema: &str,
        table: &str,
    ) -> QuarryResult<TableStructure> {
        let params = [("param_table", table)];
        let columns = self
            .fetch(COLUMNS_QUERY, &params)
            .await?
            .iter()
            .map(|c| {
                column_from_parts(
                    &c["name"],
                    &c["type"],
                    &c["default_kind"],
                    &c["default_expression"],
                    &c["is_in_primary_key"],
                )
            })
            .collect();

        let indexes = match self.fetch(INDEXES_QUERY, &params).await {
            Ok(rows) => rows.iter().map(|i| index_from_parts(&i["name"], &i["expr"])).collect(),
            Err(e) if e.is_connection_failure() => return Err(e),
            Err(e) => {
                tracing::debug!(
                    connection_id = %self.id,
                    error = %e,
                    "Skipping data skipping indices"
                );
                Vec::new()
            }
        };

        Ok(TableStructure { columns, indexes, foreign_keys: Vec::new() })
    }

    async fn get_table_data(&self, req: &TableDataRequest) -> QuarryResult<TableData> {
        let table = backtick(&req.table);
        let count_rows = self.fetch(&statements::count_statement(&table, req), &[]).await?;
        let total = parse_count(&count_rows)?;
        let data = self.fetch(&statements::page_statement(&table, req), &[]).await?;
        Ok(TableData { data, total, page: req.effective_page(), limit: req.effective_limit() })
    }

    async fn execute_query(&self, query: &str) -> QuarryResult<QueryResult> {
        let query = statements::check_query_text(query)?;
        let started = Instant::now();
        match self.run(query).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => Ok(QueryResult::failed(e.to_string(), started.elapsed().as_millis() as u64)),
        }
    }

    async fn schema_overview(&self) -> QuarryResult<SchemaOverview> {
        let rows = self.fetch(SCHEMA_OVERVIEW_QUERY, &[]).await?;
        Ok(overview_from_rows(&rows))
    }

    async fn close(&self) {
        if self.client.write().take().is_some() {
            tracing::debug!(connection_id = %self.id, "ClickHouse client released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_statement_formats_reads_only() {
        assert_eq!(prepare_statement("SELECT 1;"), "SELECT 1 FORMAT JSONEachRow");
        assert_eq!(prepare_statement("  show tables  "), "show tables FORMAT JSONEachRow");
        assert_eq!(prepare_statement("EXISTS TABLE t"), "EXISTS TABLE t FORMAT JSONEachRow");
        assert_eq!(prepare_statement("SELECT 1 FORMAT CSV"), "SELECT 1 FORMAT CSV");
        assert_eq!(prepare_statement("INSERT INTO t VALUES (1);"), "INSERT INTO t VALUES (1)");
        assert!(!is_read_statement("ALTER TABLE t DELETE WHERE 1"));
        assert!(is_read_statement("with x as (select 1) select * from x"));
    }

    #[test]
    fn test_parse_rows_and_count() {
        let rows = parse_rows("{\"count()\":\"42\"}\n\n{\"count()\":7}\nnot json\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(parse_count(&rows).unwrap(), 42);
        assert_eq!(parse_count(&[json!({ "COUNT()": 9 })]).unwrap(), 9);
    }

    #[test]
    fn test_malformed_count_is_query_error() {
        let malformed =
            [vec![], vec![json!({ "count()": "many" })], vec![json!([1])], vec![json!({})]];
        for rows in malformed {
            let err = parse_count(&rows).unwrap_err();
            assert!(matches!(err, QuarryError::Query { .. }), "{rows:?} gave {err:?}");
        }
    }

    #[test]
    fn test_overview_is_one_joined_statement() {
        assert_eq!(SCHEMA_OVERVIEW_QUERY.matches(';').count(), 0);
        assert!(SCHEMA_OVERVIEW_QUERY.contains("LEFT JOIN"));
        assert!(SCHEMA_OVERVIEW_QUERY.contains("system.data_skipping_indices"));
        assert!(prepare_statement(SCHEMA_OVERVIEW_QUERY).ends_with("FORMAT JSONEachRow"));
    }

    #[test]
    fn test_overview_rows_carry_columns_and_indexes() {
        let rows = parse_rows(concat!(
            r#"{"schema":"analytics","name":"events","type":"MergeTree","#,
            r#""columns_raw":[["id","UInt64","","",1],["ts","DateTime","DEFAULT","now()",0]],"#,
            r#""indexes_raw":[["idx_ts","ts","minmax"]]}"#,
            "\n",
            r#"{"schema":"analytics","name":"plain","type":"Log","#,
            r#""columns_raw":[["v","String","","",0]],"indexes_raw":[]}"#,
        ));
        let overview = overview_from_rows(&rows);
        assert_eq!(overview.tables.len(), 2);

        let events = &overview.tables[0];
        assert_eq!(events.table_type, "MergeTree");
        assert_eq!(events.columns.len(), 2);
        assert!(events.columns[0].primary_key);
        assert_eq!(events.columns[1].default.as_deref(), Some("DEFAULT now()"));
        assert_eq!(events.indexes.len(), 1);
        assert_eq!(events.indexes[0].name, "idx_ts");

        assert!(overview.tables[1].indexes.is_empty());
        assert!(overview.tables[1].foreign_keys.is_empty());
    }

    #[test]
    fn test_column_defaults_and_nullability() {
        let column = column_from_parts(
            &json!("created_at"),
            &json!("Nullable(DateTime)"),
            &json!("DEFAULT"),
            &json!("now()"),
            &json!(0),
        );
        assert!(column.nullable);
        assert_eq!(column.default.as_deref(), Some("DEFAULT now()"));
        assert!(!column.primary_key);

        let id =
            column_from_parts(&json!("id"), &json!("UInt64"), &json!(""), &json!(""), &json!(1));
        assert!(!id.nullable);
        assert_eq!(id.default, None);
        assert!(id.primary_key);
    }

    #[test]
    fn test_backtick_escapes() {
        assert_eq!(backtick("events"), "`events`");
        assert_eq!(backtick("we`ird"), "`we``ird`");
    }
}
