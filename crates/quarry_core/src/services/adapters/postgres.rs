//! PostgreSQL adapter over a deadpool-postgres pool.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ColumnInfo, ConnectionConfig, ForeignKeyInfo, IndexInfo, QueryResult,
    SchemaOverview, TableData, TableDataRequest, TableInfo, TableStructure, TableWithStructure,
};
use crate::services::adapter::{DatabaseAdapter, Endpoint};
use crate::services::statements;

const LIST_TABLES_QUERY: &str = r#"
SELECT
    table_schema::text AS schema,
    table_name::text AS name,
    CASE
        WHEN table_type = 'BASE TABLE' THEN 'table'
        WHEN table_type = 'VIEW' THEN 'view'
        ELSE 'table'
    END AS type
FROM information_schema.tables
WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
ORDER BY table_schema, table_name
"#;

const COLUMNS_QUERY: &str = r#"
SELECT
    c.column_name::text AS name,
    c.data_type::text AS type,
    c.is_nullable = 'YES' AS nullable,
    c.column_default::text AS default,
    EXISTS(
        SELECT 1 FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        WHERE tc.table_schema = c.table_schema
            AND tc.table_name = c.table_name
            AND kcu.column_name = c.column_name
            AND tc.constraint_type = 'PRIMARY KEY'
    ) AS primary_key
FROM information_schema.columns c
WHERE c.table_schema = $1 AND c.table_name = $2
ORDER BY c.ordinal_position
"#;

const INDEXES_QUERY: &str = r#"
SELECT
    i.indexname::text AS name,
    array_agg(a.attname::text)::text[] AS columns,
    idx.indisunique AS unique,
    idx.indisprimary AS primary
FROM pg_indexes i
JOIN pg_namespace n ON n.nspname = i.schemaname
JOIN pg_class c ON c.relname = i.indexname AND c.relnamespace = n.oid
JOIN pg_index idx ON idx.indexrelid = c.oid
JOIN pg_attribute a ON a.attrelid = idx.indrelid AND a.attnum = ANY(idx.indkey)
WHERE i.schemaname = $1 AND i.tablename = $2
GROUP BY i.indexname, idx.indisunique, idx.indisprimary
ORDER BY i.indexname
"#;

const FOREIGN_KEYS_QUERY: &str = r#"
SELECT
    tc.constraint_name::text AS name,
    kcu.column_name::text AS column,
    ccu.table_name::text AS references_table,
    ccu.column_name::text AS references_column
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
    ON tc.constraint_name = kcu.constraint_name
    AND tc.table_schema = kcu.table_schema
JOIN information_schema.constraint_column_usage ccu
    ON tc.constraint_name = ccu.constraint_name
    AND tc.table_schema = ccu.constraint_schema
WHERE tc.constraint_type = 'FOREIGN KEY'
    AND tc.table_schema = $1
    AND tc.table_name = $2
"#;

/// Whole-database structure in one statement, so the overview never mixes
/// two catalog states.
const SCHEMA_OVERVIEW_QUERY: &str = r#"
WITH tables_data AS (
    SELECT
        table_schema::text AS table_schema,
        table_name::text AS table_name,
        CASE WHEN table_type = 'VIEW' THEN 'view' ELSE 'table' END AS table_type
    FROM information_schema.tables
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
),
primary_keys AS (
    SELECT ku.table_schema, ku.table_name, ku.column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage ku
        ON tc.constraint_name = ku.constraint_name
        AND tc.table_schema = ku.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
),
columns_data AS (
    SELECT
        c.table_schema::text AS table_schema,
        c.table_name::text AS table_name,
        json_agg(json_build_object(
            'name', c.column_name,
            'type', c.data_type,
            'nullable', c.is_nullable = 'YES',
            'default', c.column_default,
            'primary_key', pk.column_name IS NOT NULL
        ) ORDER BY c.ordinal_position) AS columns
    FROM information_schema.columns c
    LEFT JOIN primary_keys pk
        ON c.table_schema = pk.table_schema
        AND c.table_name = pk.table_name
        AND c.column_name = pk.column_name
    WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
    GROUP BY c.table_schema, c.table_name
),
foreign_keys_data AS (
    SELECT
        tc.table_schema::text AS table_schema,
        tc.table_name::text AS table_name,
        json_agg(json_build_object(
            'name', tc.constraint_name,
            'column', kcu.column_name,
            'references_table', ccu.table_name,
            'references_column', ccu.column_name
        )) AS foreign_keys
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
        ON ccu.constraint_name = tc.constraint_name
        AND ccu.constraint_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
        AND tc.table_schema NOT IN ('pg_catalog', 'information_schema')
    GROUP BY tc.table_schema, tc.table_name
),
indexes_data AS (
    SELECT
        n.nspname::text AS table_schema,
        t.relname::text AS table_name,
        json_agg(json_build_object(
            'name', ic.relname,
            'columns', (
                SELECT COALESCE(array_agg(a.attname::text ORDER BY k.ord), ARRAY[]::text[])
                FROM unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            ),
            'unique', ix.indisunique,
            'primary', ix.indisprimary
        ) ORDER BY ic.relname) AS indexes
    FROM pg_index ix
    JOIN pg_class ic ON ic.oid = ix.indexrelid
    JOIN pg_class t ON t.oid = ix.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
        AND n.nspname NOT LIKE 'pg_toast%'
    GROUP BY n.nspname, t.relname
)
SELECT
    td.table_schema AS schema,
    td.table_name AS name,
    td.table_type AS type,
    COALESCE(cd.columns, '[]'::json) AS columns,
    COALESCE(fk.foreign_keys, '[]'::json) AS foreign_keys,
    COALESCE(idx.indexes, '[]'::json) AS indexes
FROM tables_data td
LEFT JOIN columns_data cd
    ON td.table_schema = cd.table_schema AND td.table_name = cd.table_name
LEFT JOIN foreign_keys_data fk
    ON td.table_schema = fk.table_schema AND td.table_name = fk.table_name
LEFT JOIN indexes_data idx
    ON td.table_schema = idx.table_schema AND td.table_name = idx.table_name
ORDER BY td.table_schema, td.table_name
"#;

/// Live PostgreSQL session.
pub struct PostgresAdapter {
    id: Uuid,
    pool: Pool,
}

impl PostgresAdapter {
    /// Build the pool and validate it with `SELECT 1`.
    pub async fn connect(config: &ConnectionConfig, endpoint: &Endpoint) -> QuarryResult<Self> {
        let connect_timeout =
            Duration::from_secs(u64::from(config.options.connect_timeout_secs.max(1)));

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&endpoint.host);
        pg_config.port(endpoint.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.username);
        if let Some(ref password) = config.password {
            pg_config.password(password);
        }
        pg_config.application_name(&config.options.application_name);
        pg_config.connect_timeout(connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));
        if let Some(secs) = config.options.statement_timeout_secs {
            pg_config.options(&format!("-c statement_timeout={}ms", u64::from(secs) * 1000));
        }

        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };
        let manager = if config.tls {
            // Matches sslmode=require: encrypted, certificate not verified.
            let connector =
                TlsConnector::builder().danger_accept_invalid_certs(true).build().map_err(|e| {
                    QuarryError::network_with_hint(
                        format!("Failed to create TLS connector: {e}"),
                        "Check your system's TLS configuration",
                    )
                })?;
            Manager::from_config(pg_config, MakeTlsConnector::new(connector), manager_config)
        } else {
            Manager::from_config(pg_config, NoTls, manager_config)
        };

        let pool = Pool::builder(manager)
            .max_size(config.options.pool_max_size.max(1))
            .wait_timeout(Some(Duration::from_secs(30)))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| QuarryError::internal(format!("Failed to create pool: {e}")))?;

        let client = pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        drop(client);

        tracing::info!(
            connection_id = %config.id,
            host = %endpoint.host,
            port = endpoint.port,
            database = %config.database,
            "PostgreSQL pool created"
        );

        Ok(Self { id: config.id, pool })
    }

    async fn client(&self) -> QuarryResult<deadpool_postgres::Object> {
        Ok(self.pool.get().await?)
    }

    async fn run_statement(&self, query: &str) -> QuarryResult<QueryResult> {
        let started = Instant::now();
        let client = self.client().await?;

        match run_on_client(&client, query, started).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let err = QuarryError::from(e);
                if err.is_connection_failure() {
                    return Err(err);
                }
                tracing::debug!(connection_id = %self.id, error = %err, "Statement failed");
                Ok(QueryResult::failed(err.to_string(), started.elapsed().as_millis() as u64))
            }
        }
    }
}

/// Statements without a result set report affected rows instead.
async fn run_on_client(
    client: &tokio_postgres::Client,
    query: &str,
    started: Instant,
) -> Result<QueryResult, tokio_postgres::Error> {
    let statement = client.prepare(query).await?;
    if statement.columns().is_empty() {
        let affected = client.execute(&statement, &[]).await?;
        return Ok(QueryResult::affected(affected as i64, started.elapsed().as_millis() as u64));
    }
    let rows = client.query(&statement, &[]).await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(QueryResult::rows(rows.iter().map(row_to_json).collect(), elapsed_ms))
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn ping(&self) -> QuarryResult<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn list_tables(&self) -> QuarryResult<Vec<TableInfo>> {
        let client = self.client().await?;
        let rows = client.query(LIST_TABLES_QUERY, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                TableInfo::new(
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    row.get::<_, String>(2),
                )
            })
            .collect())
    }

    async fn get_table_structure(&self, schema: &str, table: &str) -> QuarryResult<TableStructure> {
        let client = self.client().await?;

        let columns = client
            .query(COLUMNS_QUERY, &[&schema, &table])
            .await?
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get(2),
                default: row.get(3),
                primary_key: row.get(4),
            })
            .collect();

        let indexes = client
            .query(INDEXES_QUERY, &[&schema, &table])
            .await?
            .iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                columns: row.get::<_, Option<Vec<String>>>(1).unwrap_or_default(),
                unique: row.get(2),
                primary: row.get(3),
            })
            .collect();

        let foreign_keys = client
            .query(FOREIGN_KEYS_QUERY, &[&schema, &table])
            .await?
            .iter()
            .map(|row| ForeignKeyInfo {
                name: row.get(0),
                column: row.get(1),
                references_table: row.get(2),
                references_column: row.get(3),
            })
            .collect();

        Ok(TableStructure { columns, indexes, foreign_keys })
    }

    async fn get_table_data(&self, req: &TableDataRequest) -> QuarryResult<TableData> {
        let client = self.client().await?;
        let table = statements::table_ref(BackendKind::Relational, &req.schema, &req.table);

        let total: i64 =
            client.query_one(&statements::count_statement(&table, req), &[]).await?.get(0);
        let rows = client.query(&statements::page_statement(&table, req), &[]).await?;

        Ok(TableData {
            data: rows.iter().map(row_to_json).collect(),
            total,
            page: req.effective_page(),
            limit: req.effective_limit(),
        })
    }

    async fn execute_query(&self, query: &str) -> QuarryResult<QueryResult> {
        let query = statements::check_query_text(query)?;
        self.run_statement(query).await
    }

    async fn schema_overview(&self) -> QuarryResult<SchemaOverview> {
        let client = self.client().await?;
        let rows = client.query(SCHEMA_OVERVIEW_QUERY, &[]).await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            tables.push(TableWithStructure {
                schema: row.get("schema"),
                name: row.get("name"),
                table_type: row.get("type"),
                columns: serde_json::from_value(row.get::<_, Value>("columns"))?,
                foreign_keys: serde_json::from_value(row.get::<_, Value>("foreign_keys"))?,
                indexes: serde_json::from_value(row.get::<_, Value>("indexes"))?,
            });
        }
        Ok(SchemaOverview { tables })
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close();
            tracing::debug!(connection_id = %self.id, "PostgreSQL pool closed");
        }
    }
}

/// Any column value as raw wire bytes; used for NULL detection and fallback.
struct RawBytes(Vec<u8>);

type DecodeError = Box<dyn std::error::Error + Sync + Send>;

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// NUMERIC rendered as its exact decimal text.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        decode_numeric(raw).map(Self).ok_or_else(|| "invalid numeric value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the binary NUMERIC format: base-10000 digit groups with a weight,
/// a sign word and a display scale.
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word =
        |i: usize| -> Option<u16> { Some(u16::from_be_bytes([*raw.get(i)?, *raw.get(i + 1)?])) };
    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = word(6)? as usize;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits).map(|i| word(8 + 2 * i)).collect::<Option<Vec<u16>>>()?;
    let digit = |i: i32| -> u16 {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(out, "{}", digit(i));
            } else {
                let _ = write!(out, "{:04}", digit(i));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

fn typed<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, i: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(i).ok().flatten()
}

fn number<N: Into<serde_json::Number>>(n: Option<N>) -> Value {
    n.map(|v| Value::Number(v.into())).unwrap_or(Value::Null)
}

fn float(f: Option<f64>) -> Value {
    f.and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null)
}

fn text<T: ToString>(v: Option<T>) -> Value {
    v.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null)
}

fn array<T>(items: Option<Vec<Option<T>>>, f: impl Fn(T) -> Value) -> Value {
    match items {
        Some(items) => {
            Value::Array(items.into_iter().map(|v| v.map(&f).unwrap_or(Value::Null)).collect())
        }
        None => Value::Null,
    }
}

fn column_value(row: &tokio_postgres::Row, i: usize, ty: &Type) -> Value {
    let Some(RawBytes(raw)) = typed::<RawBytes>(row, i) else {
        return Value::Null;
    };

    match *ty {
        Type::BOOL => typed::<bool>(row, i).map(Value::Bool).unwrap_or(Value::Null),
        Type::INT2 => number(typed::<i16>(row, i)),
        Type::INT4 => number(typed::<i32>(row, i)),
        Type::INT8 => number(typed::<i64>(row, i)),
        Type::OID => number(typed::<u32>(row, i)),
        Type::FLOAT4 => float(typed::<f32>(row, i).map(f64::from)),
        Type::FLOAT8 => float(typed::<f64>(row, i)),
        Type::NUMERIC => text(typed::<NumericText>(row, i).map(|n| n.0)),
        Type::UUID => text(typed::<Uuid>(row, i)),
        Type::JSON | Type::JSONB => typed::<Value>(row, i).unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => typed::<chrono::DateTime<chrono::Utc>>(row, i)
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => text(typed::<chrono::NaiveDateTime>(row, i)),
        Type::DATE => text(typed::<chrono::NaiveDate>(row, i)),
        Type::TIME => text(typed::<chrono::NaiveTime>(row, i)),
        Type::INT2_ARRAY => array(typed::<Vec<Option<i16>>>(row, i), |v| Value::Number(v.into())),
        Type::INT4_ARRAY => array(typed::<Vec<Option<i32>>>(row, i), |v| Value::Number(v.into())),
        Type::INT8_ARRAY => array(typed::<Vec<Option<i64>>>(row, i), |v| Value::Number(v.into())),
        Type::BOOL_ARRAY => array(typed::<Vec<Option<bool>>>(row, i), Value::Bool),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            array(typed::<Vec<Option<String>>>(row, i), Value::String)
        }
        Type::BYTEA => {
            let mut hex = String::with_capacity(2 + raw.len() * 2);
            hex.push_str("\\x");
            for byte in &raw {
                let _ = write!(hex, "{byte:02x}");
            }
            Value::String(hex)
        }
        _ => match typed::<String>(row, i) {
            Some(text) => Value::String(text),
            // Enum and other text-encoded values arrive as UTF-8 on the wire.
            None if matches!(ty.kind(), Kind::Enum(_)) || std::str::from_utf8(&raw).is_ok() => {
                Value::String(String::from_utf8_lossy(&raw).into_owned())
            }
            None => Value::String(format!("<{}>", ty.name())),
        },
    }
}

/// Convert a row to a JSON object keyed by column name.
fn row_to_json(row: &tokio_postgres::Row) -> Value {
    let mut object = Map::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_value(row, i, column.type_()));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        assert_eq!(decode_numeric(&numeric(2, 0, 0, 2, &[123, 4500])).as_deref(), Some("123.45"));
        assert_eq!(decode_numeric(&numeric(1, 1, 0, 0, &[1])).as_deref(), Some("10000"));
        assert_eq!(decode_numeric(&numeric(1, -1, 0x4000, 3, &[50])).as_deref(), Some("-0.005"));
        assert_eq!(decode_numeric(&numeric(1, -2, 0, 6, &[1200])).as_deref(), Some("0.000012"));
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 0, &[])).as_deref(), Some("0"));
        assert_eq!(decode_numeric(&numeric(0, 0, 0xC000, 0, &[])).as_deref(), Some("NaN"));
        assert_eq!(decode_numeric(&[0, 1]), None);
    }

    #[test]
    fn test_overview_query_is_single_statement() {
        assert_eq!(SCHEMA_OVERVIEW_QUERY.matches(';').count(), 0);
        assert!(SCHEMA_OVERVIEW_QUERY.contains("json_agg"));
    }
}
