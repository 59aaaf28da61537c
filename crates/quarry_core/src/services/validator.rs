//! Raw-SQL allow-list.
//!
//! Row edits may flag a value as a backend expression instead of a literal.
//! Such values are pasted into statement text unparameterized, so only the
//! side-effect-free expressions listed here are accepted. Matching is exact
//! after trimming surrounding whitespace, with an ASCII case-insensitive
//! fallback for the keywords and functions in [`CASE_INSENSITIVE_RAW_SQL`].

use crate::error::{QuarryError, QuarryResult};
use crate::models::RowValue;

/// Expressions accepted for values flagged as raw SQL.
pub const ALLOWED_RAW_SQL: &[&str] = &[
    // PostgreSQL
    "now()",
    "current_timestamp",
    "localtimestamp",
    "current_date",
    "now()::date",
    "current_time",
    "localtime",
    "gen_random_uuid()",
    "uuid_generate_v4()",
    "DEFAULT",
    "TRUE",
    "FALSE",
    "'{}'::json",
    "'[]'::json",
    "'{}'::jsonb",
    "'[]'::jsonb",
    // SQLite
    "datetime('now')",
    "datetime('now', 'localtime')",
    "date('now')",
    "date('now', 'localtime')",
    "time('now')",
    "time('now', 'localtime')",
    "NULL",
    "1",
    "0",
    // ClickHouse
    "now64()",
    "today()",
    "yesterday()",
    "generateUUIDv4()",
    "true",
    "false",
    "'{}'",
];

/// Expressions also accepted in any letter case (`NOW()`, `Current_Date`).
pub const CASE_INSENSITIVE_RAW_SQL: &[&str] = &[
    "true",
    "false",
    "null",
    "default",
    "now()",
    "current_timestamp",
    "localtimestamp",
    "current_date",
    "current_time",
    "localtime",
    "gen_random_uuid()",
    "uuid_generate_v4()",
    "datetime('now')",
    "datetime('now', 'localtime')",
    "date('now')",
    "date('now', 'localtime')",
    "time('now')",
    "time('now', 'localtime')",
    "now64()",
    "today()",
    "yesterday()",
    "generateuuidv4()",
];

/// Whether `candidate` is an allowed raw expression.
pub fn is_allowed(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    !trimmed.is_empty() && matches_allow_list(trimmed)
}

fn matches_allow_list(trimmed: &str) -> bool {
    ALLOWED_RAW_SQL.contains(&trimmed)
        || CASE_INSENSITIVE_RAW_SQL.iter().any(|allowed| allowed.eq_ignore_ascii_case(trimmed))
}

/// Check a single raw expression, returning the trimmed form to emit.
pub fn validate_raw_sql(candidate: &str) -> QuarryResult<&str> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(QuarryError::raw_sql_rejected(candidate, "Raw SQL value cannot be empty"));
    }
    if !matches_allow_list(trimmed) {
        return Err(QuarryError::raw_sql_rejected(
            trimmed,
            "Only predefined SQL functions are allowed as raw values",
        ));
    }
    Ok(trimmed)
}

/// Check every raw-flagged value of a batch.
///
/// Fails on the first rejected token; literal values are not inspected.
pub fn validate_row_values(values: &[RowValue]) -> QuarryResult<()> {
    for value in values.iter().filter(|v| v.is_raw_sql) {
        let raw = value.value.as_str().ok_or_else(|| {
            QuarryError::raw_sql_rejected(value.value.to_string(), "Raw SQL value must be a string")
        })?;
        validate_raw_sql(raw)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_allows_listed_expressions() {
        for expr in ALLOWED_RAW_SQL {
            assert!(is_allowed(expr), "{expr} should be allowed");
        }
        assert!(is_allowed("  gen_random_uuid()  "));
        assert_eq!(validate_raw_sql(" now() ").unwrap(), "now()");
    }

    #[test]
    fn test_rejects_injection_attempts() {
        for candidate in [
            "DROP TABLE x",
            "now(); DROP TABLE users",
            "1 OR 1=1",
            "(SELECT password FROM users)",
            "now() -- comment",
            "",
            "   ",
        ] {
            assert!(!is_allowed(candidate), "{candidate:?} should be rejected");
            let err = validate_raw_sql(candidate).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RawSqlRejected);
        }
    }

    #[test]
    fn test_keywords_match_in_any_case() {
        let keywords =
            ["NOW()", "Now()", "default", "CURRENT_TIMESTAMP", "GENERATEUUIDV4()", "Null"];
        for candidate in keywords {
            assert!(is_allowed(candidate), "{candidate:?} should be allowed");
        }
        assert_eq!(validate_raw_sql(" NOW() ").unwrap(), "NOW()");

        // Only the listed keywords get the fallback.
        assert!(is_allowed("'{}'::jsonb"));
        assert!(!is_allowed("'{}'::JSONB"));
        assert!(!is_allowed("NOW() OR 1=1"));
    }

    #[test]
    fn test_batch_rejects_any_bad_token() {
        let batch = vec![
            RowValue::literal("name", "DROP TABLE x"),
            RowValue::raw("created_at", "now()"),
        ];
        assert!(validate_row_values(&batch).is_ok());

        let batch =
            vec![RowValue::raw("created_at", "now()"), RowValue::raw("name", "DROP TABLE x")];
        assert!(matches!(
            validate_row_values(&batch),
            Err(QuarryError::RawSqlRejected { ref value, .. }) if value == "DROP TABLE x"
        ));

        let non_string = vec![RowValue { column: "n".into(), value: json!(1), is_raw_sql: true }];
        assert!(validate_row_values(&non_string).is_err());
    }
}
