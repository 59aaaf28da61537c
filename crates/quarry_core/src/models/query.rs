//! Query results and row edit requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of `execute_query` and of the row edit commands.
///
/// Statement failures travel in `error` rather than as an `Err`, so the
/// caller keeps the statement text it was editing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows as JSON objects keyed by column name.
    pub data: Vec<Value>,
    /// Rows returned, or rows affected for write statements.
    pub row_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_taken_ms: Option<u64>,
}

impl QueryResult {
    /// Successful result carrying rows.
    pub fn rows(data: Vec<Value>, time_taken_ms: u64) -> Self {
        let row_count = data.len() as i64;
        Self { data, row_count, error: None, time_taken_ms: Some(time_taken_ms) }
    }

    /// Successful write reporting affected rows.
    pub fn affected(row_count: i64, time_taken_ms: u64) -> Self {
        Self { data: Vec::new(), row_count, error: None, time_taken_ms: Some(time_taken_ms) }
    }

    /// Statement failure reported in-band.
    pub fn failed(message: impl Into<String>, time_taken_ms: u64) -> Self {
        Self {
            data: Vec::new(),
            row_count: 0,
            error: Some(message.into()),
            time_taken_ms: Some(time_taken_ms),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of a test dial that does not register a pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConnectionResult {
    pub success: bool,
    pub message: String,
}

impl TestConnectionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

/// A column value in a row edit.
///
/// When `is_raw_sql` is set the value is emitted verbatim into the
/// statement and must pass the raw-SQL allow-list first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowValue {
    pub column: String,
    pub value: Value,
    #[serde(rename = "isRawSql", default)]
    pub is_raw_sql: bool,
}

impl RowValue {
    pub fn literal(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { column: column.into(), value: value.into(), is_raw_sql: false }
    }

    pub fn raw(column: impl Into<String>, expression: impl Into<String>) -> Self {
        Self { column: column.into(), value: Value::String(expression.into()), is_raw_sql: true }
    }
}

/// Insert a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowInsert {
    pub schema: String,
    pub table: String,
    pub values: Vec<RowValue>,
}

/// Update the row identified by its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowUpdate {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub primary_key_columns: Vec<String>,
    #[serde(default)]
    pub primary_key_values: Vec<Value>,
    pub updates: Vec<RowValue>,
}

/// Delete the row identified by its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowDelete {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub primary_key_columns: Vec<String>,
    #[serde(default)]
    pub primary_key_values: Vec<Value>,
}
