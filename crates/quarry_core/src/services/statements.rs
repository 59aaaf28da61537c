//! Statement text builders shared by the SQL adapters.
//!
//! Row edits are rendered to plain statement text: identifiers are quoted
//! with doubled inner quotes, literals are single-quoted with doubled inner
//! quotes, and raw-SQL values are emitted verbatim only after passing
//! [`validator`](super::validator). All precondition checks run here, before
//! any statement reaches a backend.

use serde_json::Value;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{BackendKind, RowDelete, RowInsert, RowUpdate, RowValue, TableDataRequest};
use crate::services::validator;

/// Double embedded double quotes.
pub fn escape_identifier(identifier: &str) -> String {
    identifier.replace('"', "\"\"")
}

/// Wrap an identifier in double quotes.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", escape_identifier(identifier))
}

/// Table reference used in row edits.
///
/// SQLite has a single implicit schema, so only the table is named.
pub fn table_ref(kind: BackendKind, schema: &str, table: &str) -> String {
    match kind {
        BackendKind::FileBased => quote_identifier(table),
        _ => format!("{}.{}", quote_identifier(schema), quote_identifier(table)),
    }
}

/// Render a JSON value as a SQL literal.
pub fn format_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Undo editor autocorrect in a filter and drop blank filters.
///
/// Curly quotes become straight quotes and `\'` becomes `'`.
pub fn normalize_filter(filter: Option<&str>) -> Option<String> {
    let filter = filter?.trim();
    if filter.is_empty() {
        return None;
    }
    Some(
        filter
            .replace(['\u{2018}', '\u{2019}'], "'")
            .replace(['\u{201C}', '\u{201D}'], "\"")
            .replace("\\'", "'"),
    )
}

fn where_clause(filter: Option<&str>) -> String {
    match normalize_filter(filter) {
        Some(f) => format!(" WHERE {f}"),
        None => String::new(),
    }
}

/// `SELECT COUNT(*)` over the filtered table.
pub fn count_statement(table_ref: &str, req: &TableDataRequest) -> String {
    format!("SELECT COUNT(*) FROM {table_ref}{}", where_clause(req.filter.as_deref()))
}

/// `SELECT *` for one page of the filtered, optionally sorted table.
pub fn page_statement(table_ref: &str, req: &TableDataRequest) -> String {
    let order = match req.sort_column.as_deref().map(str::trim) {
        Some(column) if !column.is_empty() => {
            format!(" ORDER BY {} {}", quote_identifier(column), req.sort_direction.as_sql())
        }
        _ => String::new(),
    };
    format!(
        "SELECT * FROM {table_ref}{}{order} LIMIT {} OFFSET {}",
        where_clause(req.filter.as_deref()),
        req.effective_limit(),
        req.offset()
    )
}

/// Reject blank query text.
pub fn check_query_text(query: &str) -> QuarryResult<&str> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(QuarryError::precondition("Query text cannot be empty"));
    }
    Ok(trimmed)
}

fn check_primary_key(columns: &[String], values: &[Value]) -> QuarryResult<()> {
    if columns.is_empty() {
        return Err(QuarryError::precondition("At least one primary key column is required"));
    }
    if columns.len() != values.len() {
        return Err(QuarryError::precondition(format!(
            "Primary key columns and values must match ({} columns, {} values)",
            columns.len(),
            values.len()
        )));
    }
    Ok(())
}

/// Preconditions of an insert, including the raw-SQL allow-list.
pub fn check_insert(req: &RowInsert) -> QuarryResult<()> {
    if req.values.is_empty() {
        return Err(QuarryError::precondition("No values provided"));
    }
    validator::validate_row_values(&req.values)
}

/// Preconditions of an update, including the raw-SQL allow-list.
pub fn check_update(req: &RowUpdate) -> QuarryResult<()> {
    check_primary_key(&req.primary_key_columns, &req.primary_key_values)?;
    if req.updates.is_empty() {
        return Err(QuarryError::precondition("No updates provided"));
    }
    validator::validate_row_values(&req.updates)
}

/// Preconditions of a delete.
pub fn check_delete(req: &RowDelete) -> QuarryResult<()> {
    check_primary_key(&req.primary_key_columns, &req.primary_key_values)
}

fn render_value(value: &RowValue) -> QuarryResult<String> {
    if !value.is_raw_sql {
        return Ok(format_literal(&value.value));
    }
    let raw = value.value.as_str().ok_or_else(|| {
        QuarryError::raw_sql_rejected(value.value.to_string(), "Raw SQL value must be a string")
    })?;
    Ok(validator::validate_raw_sql(raw)?.to_string())
}

fn primary_key_predicate(columns: &[String], values: &[Value]) -> String {
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| match value {
            Value::Null => format!("{} IS NULL", quote_identifier(column)),
            v => format!("{} = {}", quote_identifier(column), format_literal(v)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `INSERT INTO t ("c", ...) VALUES (...)`.
pub fn insert_statement(kind: BackendKind, req: &RowInsert) -> QuarryResult<String> {
    check_insert(req)?;
    let columns: Vec<String> = req.values.iter().map(|v| quote_identifier(&v.column)).collect();
    let values = req.values.iter().map(render_value).collect::<QuarryResult<Vec<_>>>()?;
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table_ref(kind, &req.schema, &req.table),
        columns.join(", "),
        values.join(", ")
    ))
}

/// `UPDATE t SET "c" = v, ... WHERE "pk" = v AND ...`.
pub fn update_statement(kind: BackendKind, req: &RowUpdate) -> QuarryResult<String> {
    check_update(req)?;
    let assignments = req
        .updates
        .iter()
        .map(|u| Ok(format!("{} = {}", quote_identifier(&u.column), render_value(u)?)))
        .collect::<QuarryResult<Vec<_>>>()?;
    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        table_ref(kind, &req.schema, &req.table),
        assignments.join(", "),
        primary_key_predicate(&req.primary_key_columns, &req.primary_key_values)
    ))
}

/// `DELETE FROM t WHERE "pk" = v AND ...`.
pub fn delete_statement(kind: BackendKind, req: &RowDelete) -> QuarryResult<String> {
    check_delete(req)?;
    Ok(format!(
        "DELETE FROM {} WHERE {}",
        table_ref(kind, &req.schema, &req.table),
        primary_key_predicate(&req.primary_key_columns, &req.primary_key_values)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::SortDirection;
    use serde_json::json;

    #[test]
    fn test_identifier_escaping() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("col\" OR 1=1 --"), "\"col\"\" OR 1=1 --\"");
        assert_eq!(table_ref(BackendKind::Relational, "public", "users"), "\"public\".\"users\"");
        assert_eq!(table_ref(BackendKind::FileBased, "main", "users"), "\"users\"");
    }

    #[test]
    fn test_literal_formatting() {
        assert_eq!(format_literal(&json!(null)), "NULL");
        assert_eq!(format_literal(&json!(true)), "TRUE");
        assert_eq!(format_literal(&json!(42)), "42");
        assert_eq!(format_literal(&json!(1.5)), "1.5");
        assert_eq!(format_literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(format_literal(&json!({"a": "it's"})), "'{\"a\":\"it''s\"}'");
        assert_eq!(format_literal(&json!([1, 2])), "'[1,2]'");
    }

    #[test]
    fn test_filter_normalization() {
        assert_eq!(normalize_filter(Some("  ")), None);
        assert_eq!(normalize_filter(None), None);
        let smart = "name = \u{2018}Ann\u{2019} AND \u{201C}x\u{201D} = 1";
        assert_eq!(normalize_filter(Some(smart)).as_deref(), Some("name = 'Ann' AND \"x\" = 1"));
        assert_eq!(normalize_filter(Some("name = \\'Ann\\'")).as_deref(), Some("name = 'Ann'"));
    }

    #[test]
    fn test_page_and_count_statements() {
        let req = TableDataRequest::new("public", "users")
            .page(3, 25)
            .filter("id > 5")
            .sort("created_at", SortDirection::Desc);
        let table = table_ref(BackendKind::Relational, &req.schema, &req.table);

        assert_eq!(
            count_statement(&table, &req),
            r#"SELECT COUNT(*) FROM "public"."users" WHERE id > 5"#
        );
        assert_eq!(
            page_statement(&table, &req),
            concat!(
                r#"SELECT * FROM "public"."users" WHERE id > 5 "#,
                r#"ORDER BY "created_at" DESC LIMIT 25 OFFSET 50"#
            )
        );

        let plain = TableDataRequest::new("main", "t").page(0, 10);
        assert_eq!(page_statement("\"t\"", &plain), "SELECT * FROM \"t\" LIMIT 10 OFFSET 0");
    }

    #[test]
    fn test_update_statement_with_raw_sql() {
        let req = RowUpdate {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec!["id".into(), "tenant".into()],
            primary_key_values: vec![json!(5), json!("acme")],
            updates: vec![RowValue::literal("name", "Ann"), RowValue::raw("updated_at", " now() ")],
        };
        assert_eq!(
            update_statement(BackendKind::Relational, &req).unwrap(),
            "UPDATE \"public\".\"users\" SET \"name\" = 'Ann', \"updated_at\" = now() \
             WHERE \"id\" = 5 AND \"tenant\" = 'acme'"
        );
    }

    #[test]
    fn test_insert_and_delete_statements() {
        let insert = RowInsert {
            schema: "main".into(),
            table: "notes".into(),
            values: vec![
                RowValue::literal("body", "hi"),
                RowValue::raw("created", "datetime('now')"),
            ],
        };
        assert_eq!(
            insert_statement(BackendKind::FileBased, &insert).unwrap(),
            "INSERT INTO \"notes\" (\"body\", \"created\") VALUES ('hi', datetime('now'))"
        );

        let delete = RowDelete {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec!["id".into()],
            primary_key_values: vec![json!(null)],
        };
        assert_eq!(
            delete_statement(BackendKind::Relational, &delete).unwrap(),
            "DELETE FROM \"public\".\"users\" WHERE \"id\" IS NULL"
        );
    }

    #[test]
    fn test_preconditions() {
        let delete = RowDelete {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec![],
            primary_key_values: vec![],
        };
        assert_eq!(check_delete(&delete).unwrap_err().kind(), ErrorKind::Precondition);

        let mismatched = RowUpdate {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec!["id".into()],
            primary_key_values: vec![],
            updates: vec![RowValue::literal("name", "x")],
        };
        assert_eq!(check_update(&mismatched).unwrap_err().kind(), ErrorKind::Precondition);

        let empty_insert = RowInsert { schema: "s".into(), table: "t".into(), values: vec![] };
        assert_eq!(check_insert(&empty_insert).unwrap_err().kind(), ErrorKind::Precondition);

        assert_eq!(check_query_text(" \n ").unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(check_query_text(" SELECT 1 ").unwrap(), "SELECT 1");
    }

    #[test]
    fn test_rejected_raw_sql_builds_nothing() {
        let insert = RowInsert {
            schema: "public".into(),
            table: "users".into(),
            values: vec![RowValue::literal("name", "x"), RowValue::raw("id", "DROP TABLE x")],
        };
        assert_eq!(
            insert_statement(BackendKind::Relational, &insert).unwrap_err().kind(),
            ErrorKind::RawSqlRejected
        );
    }
}
