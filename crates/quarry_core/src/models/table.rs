//! Table introspection and paging models.
//!
//! Field names follow the wire shape the command surface returns, so most
//! structs serialize as-is without a separate DTO layer.

use serde::{Deserialize, Serialize};

/// Largest page a single `get_table_data` call may request.
pub const MAX_PAGE_SIZE: i64 = 10_000;

/// A table, view or keyspace visible on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Schema name ("main" for SQLite, the database for ClickHouse).
    pub schema: String,
    /// Table name.
    pub name: String,
    /// "table", "view", "keyspace" or the column-store engine name.
    #[serde(rename = "type")]
    pub table_type: String,
}

impl TableInfo {
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        table_type: impl Into<String>,
    ) -> Self {
        Self { schema: schema.into(), name: name.into(), table_type: table_type.into() }
    }
}

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Backend type name (e.g., "integer", "Nullable(String)").
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column allows NULL values.
    pub nullable: bool,
    /// Default value expression, if any.
    pub default: Option<String>,
    /// Whether this column is part of the primary key.
    pub primary_key: bool,
}

/// An index of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

/// A single-column foreign key reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Columns, indexes and foreign keys of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStructure {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

impl TableStructure {
    /// Names of the primary key columns, in column order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns.iter().filter(|c| c.primary_key).map(|c| c.name.as_str()).collect()
    }
}

/// A table with its full structure, as listed in a schema overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableWithStructure {
    pub schema: String,
    pub name: String,
    #[serde(rename = "type")]
    pub table_type: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub indexes: Vec<IndexInfo>,
}

impl TableWithStructure {
    /// Attach a structure to a listed table.
    pub fn from_parts(table: TableInfo, structure: TableStructure) -> Self {
        Self {
            schema: table.schema,
            name: table.name,
            table_type: table.table_type,
            columns: structure.columns,
            foreign_keys: structure.foreign_keys,
            indexes: structure.indexes,
        }
    }
}

/// Snapshot of every table on a connection.
///
/// Built from a single introspection pass and never cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaOverview {
    pub tables: Vec<TableWithStructure>,
}

/// Sort direction for paged table reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// `desc` in any case sorts descending; everything else ascends.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Arguments of `get_table_data`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDataRequest {
    pub schema: String,
    pub table: String,
    /// 1-indexed page number.
    pub page: i64,
    /// Rows per page.
    pub limit: i64,
    /// Backend-native boolean expression.
    pub filter: Option<String>,
    pub sort_column: Option<String>,
    pub sort_direction: SortDirection,
}

impl TableDataRequest {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            page: 1,
            limit: 100,
            filter: None,
            sort_column: None,
            sort_direction: SortDirection::Asc,
        }
    }

    pub fn page(mut self, page: i64, limit: i64) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn sort(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_column = Some(column.into());
        self.sort_direction = direction;
        self
    }

    /// Page number clamped to at least 1.
    pub fn effective_page(&self) -> i64 {
        self.page.max(1)
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Row offset of the first row on the effective page.
    pub fn offset(&self) -> i64 {
        (self.effective_page() - 1).saturating_mul(self.effective_limit())
    }

    /// Empty page answer echoing the effective paging.
    pub fn empty_page(&self) -> TableData {
        TableData {
            data: Vec::new(),
            total: 0,
            page: self.effective_page(),
            limit: self.effective_limit(),
        }
    }
}

/// One page of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    /// Rows as JSON objects keyed by column name.
    pub data: Vec<serde_json::Value>,
    /// Row count matching the filter, across all pages.
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}
