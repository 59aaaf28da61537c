//! Verification tests for the pool and access layer properties.
//!
//! Each section checks one externally observable guarantee of the pool:
//! status without I/O, single-dial connects, reconnect after a failed check,
//! pre-network rejection of bad edits, teardown order, export/import
//! fidelity, resumable key scans and in-band statement errors.
//!
//! Everything runs against the test doubles in `test_support`, except the
//! paging scenario, which uses a real SQLite file through `NativeConnector`.

#[cfg(test)]
mod tests {
    use crate::error::{ErrorKind, ErrorResponse, QuarryError};
    use crate::models::{
        BackendKind, ConnectionConfig, ConnectionStatus, RowDelete, RowInsert, RowUpdate, RowValue,
        TableDataRequest,
    };
    use crate::services::adapter::{Endpoint, NativeConnector};
    use crate::services::catalog::{ConnectionCatalog, MemoryCatalog};
    use crate::services::interchange::{export_connections, import_connections};
    use crate::services::pool::PoolManager;
    use crate::services::validator;
    use crate::test_support::{key_value_config, relational_config, tunneled_config, FakeConnector};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn pool_with(
        configs: Vec<ConnectionConfig>,
        connector: FakeConnector,
    ) -> (Arc<PoolManager>, Arc<FakeConnector>) {
        let connector = Arc::new(connector);
        let pool =
            PoolManager::new(Arc::new(MemoryCatalog::with_configs(configs)), connector.clone());
        (pool, connector)
    }

    // =========================================================================
    // Status of an unknown identifier makes no network calls
    // =========================================================================

    #[tokio::test]
    async fn test_status_of_unknown_id_is_disconnected_without_io() {
        let (pool, connector) = pool_with(vec![relational_config("idle")], FakeConnector::new());

        for _ in 0..10 {
            let report = pool.status(Uuid::new_v4());
            assert_eq!(report.status, ConnectionStatus::Disconnected);
            assert!(report.error.is_none());
        }

        assert_eq!(connector.dial_count(), 0);
        assert_eq!(connector.tunnel_count(), 0);
        assert!(pool.statuses().is_empty());
    }

    // =========================================================================
    // Concurrent connects dial once
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_connect_dials_once() {
        let config = tunneled_config("busy");
        let slow = FakeConnector::new().with_dial_delay(Duration::from_millis(50));
        let (pool, connector) = pool_with(vec![config.clone()], slow);

        let (a, b, c) =
            tokio::join!(pool.connect(config.id), pool.connect(config.id), pool.connect(config.id));
        for report in [a, b, c] {
            assert_eq!(report.unwrap().status, ConnectionStatus::Connected);
        }

        assert_eq!(connector.dial_count(), 1);
        assert_eq!(connector.tunnel_count(), 1);
        assert_eq!(connector.backend().live_adapters(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_on_different_ids_run_in_parallel() {
        let first = relational_config("first");
        let second = relational_config("second");
        let (pool, connector) = pool_with(
            vec![first.clone(), second.clone()],
            FakeConnector::new().with_dial_delay(Duration::from_millis(200)),
        );

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(pool.list_tables(first.id), pool.list_tables(second.id));
        a.unwrap();
        b.unwrap();

        assert_eq!(connector.dial_count(), 2);
        assert!(
            start.elapsed() < Duration::from_millis(400),
            "dials were serialized: {:?}",
            start.elapsed()
        );
    }

    // =========================================================================
    // A failed health check leads to exactly one reconnect on the next call
    // =========================================================================

    #[tokio::test]
    async fn test_failed_health_check_reconnects_once_on_next_operation() {
        let config = tunneled_config("flaky");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());
        pool.connect(config.id).await.unwrap();

        connector.backend().set_healthy(false);
        let check = pool.health_check(config.id).await;
        assert!(!check.success);
        assert_eq!(pool.status(config.id).status, ConnectionStatus::Disconnected);

        // The stale handle is kept until the next operation.
        assert_eq!(connector.backend().live_adapters(), 1);
        assert!(connector.backend().journal().is_empty());

        connector.backend().set_healthy(true);
        let tables = pool.list_tables(config.id).await.unwrap();
        assert_eq!(tables[0].name, "users");
        assert_eq!(connector.dial_count(), 2);
        assert_eq!(connector.backend().live_adapters(), 1);
        assert_eq!(
            connector.backend().journal(),
            vec![format!("adapter:{}", config.id), format!("tunnel:{}", config.id)]
        );

        pool.list_tables(config.id).await.unwrap();
        assert_eq!(connector.dial_count(), 2);
        assert_eq!(pool.status(config.id).status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_health_check_never_dials() {
        let config = relational_config("never-connected");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());

        assert!(!pool.health_check(config.id).await.success);
        assert_eq!(connector.dial_count(), 0);
        assert_eq!(connector.backend().pings(), 0);
    }

    // =========================================================================
    // Updates and deletes without a primary key never reach the network
    // =========================================================================

    #[tokio::test]
    async fn test_missing_primary_key_is_precondition_failure() {
        let config = relational_config("pg");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());

        let update = RowUpdate {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec![],
            primary_key_values: vec![],
            updates: vec![RowValue::literal("name", "alice")],
        };
        let err = pool.update_row(config.id, update).await.unwrap_err();
        assert!(matches!(err, QuarryError::Precondition { .. }));

        let delete = RowDelete {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec![],
            primary_key_values: vec![],
        };
        let err = pool.delete_row(config.id, delete).await.unwrap_err();
        assert_eq!(ErrorResponse::from(&err).kind, ErrorKind::Precondition);

        assert_eq!(connector.dial_count(), 0);
        assert_eq!(connector.backend().calls(), 0);
    }

    // =========================================================================
    // Raw SQL outside the allow-list is rejected before the adapter
    // =========================================================================

    #[tokio::test]
    async fn test_raw_sql_injection_is_rejected() {
        assert!(!validator::is_allowed("DROP TABLE x"));
        assert!(validator::is_allowed("now()"));
        assert!(validator::is_allowed("NOW()"));

        let config = relational_config("pg");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());

        let insert = RowInsert {
            schema: "public".into(),
            table: "users".into(),
            values: vec![
                RowValue::raw("created_at", "now()"),
                RowValue::raw("name", "DROP TABLE x"),
            ],
        };
        let err = pool.insert_row(config.id, insert).await.unwrap_err();
        assert!(matches!(err, QuarryError::RawSqlRejected { .. }));

        let update = RowUpdate {
            schema: "public".into(),
            table: "users".into(),
            primary_key_columns: vec!["id".into()],
            primary_key_values: vec![json!(1)],
            updates: vec![RowValue::literal("name", "bob"), RowValue::raw("note", "DROP TABLE x")],
        };
        let err = pool.update_row(config.id, update).await.unwrap_err();
        assert!(matches!(err, QuarryError::RawSqlRejected { .. }));

        assert_eq!(connector.dial_count(), 0);
        assert!(connector.backend().executed().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_raw_sql_is_emitted_verbatim() {
        let config = relational_config("pg");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());

        let insert = RowInsert {
            schema: "public".into(),
            table: "users".into(),
            values: vec![
                RowValue::literal("name", "O'Brien"),
                RowValue::raw("id", "gen_random_uuid()"),
                RowValue::raw("created_at", "NOW()"),
            ],
        };
        let result = pool.insert_row(config.id, insert).await.unwrap();
        assert!(!result.is_error());
        assert_eq!(
            connector.backend().executed(),
            vec![concat!(
                r#"INSERT INTO "public"."users" ("name", "id", "created_at") "#,
                r#"VALUES ('O''Brien', gen_random_uuid(), NOW())"#
            )
            .to_string()]
        );
    }

    // =========================================================================
    // Teardown closes the adapter before the tunnel
    // =========================================================================

    #[tokio::test]
    async fn test_disconnect_closes_adapter_then_tunnel() {
        let config = tunneled_config("bastion");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());
        pool.connect(config.id).await.unwrap();
        assert_eq!(
            connector.endpoints(),
            vec![Endpoint { host: "127.0.0.1".into(), port: 40_000 }]
        );

        let report = pool.disconnect(config.id).await;
        assert_eq!(report.status, ConnectionStatus::Disconnected);
        assert_eq!(
            connector.backend().journal(),
            vec![format!("adapter:{}", config.id), format!("tunnel:{}", config.id)]
        );
        assert_eq!(connector.backend().live_adapters(), 0);
        assert!(pool.statuses().is_empty());

        // Absent entries are a no-op.
        pool.disconnect(config.id).await;
        assert_eq!(connector.backend().journal().len(), 2);
    }

    #[tokio::test]
    async fn test_tunnel_failure_is_classified_apart_from_auth() {
        let config = tunneled_config("bastion");
        let (pool, connector) = pool_with(vec![config.clone()], FakeConnector::new());
        connector.fail_next_tunnels(1);

        let err = pool.connect(config.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tunnel);
        assert_eq!(connector.dial_count(), 0);
        assert!(pool.status(config.id).error.unwrap().contains("SSH"));
    }

    // =========================================================================
    // Export then import reproduces the connections under new identifiers
    // =========================================================================

    #[test]
    fn test_export_import_round_trip() {
        let source = MemoryCatalog::new();
        let originals = vec![
            tunneled_config("bastion"),
            relational_config("reporting"),
            key_value_config("cache"),
        ];
        for config in &originals {
            source.save(config).unwrap();
        }
        let ids: Vec<Uuid> = originals.iter().map(|c| c.id).collect();
        let bundle = export_connections(&source, &ids).unwrap();

        let json = serde_json::to_string(&bundle).unwrap();
        let bundle = serde_json::from_str(&json).unwrap();

        let target = MemoryCatalog::new();
        let imported = import_connections(&target, bundle).unwrap();
        assert_eq!(imported.len(), originals.len());

        for (original, copy) in originals.iter().zip(&imported) {
            assert_ne!(copy.id, original.id);
            let normalized = ConnectionConfig { id: original.id, ..copy.clone() };
            assert_eq!(&normalized, original);
        }
    }

    // =========================================================================
    // Resumable key scan
    // =========================================================================

    #[tokio::test]
    async fn test_key_scan_resumes_without_loss() {
        let cache = key_value_config("cache");
        let (pool, connector) = pool_with(vec![cache.clone()], FakeConnector::new());
        connector.backend().seed_keys((0..250).map(|i| format!("user:{i:03}")));
        connector.backend().seed_keys((0..50).map(|i| format!("order:{i:03}")));

        let first = pool.search_keys(cache.id, "user:*", 100, "").await.unwrap();
        assert_eq!(first.keys.len(), 100);
        assert!(!first.scan_complete);
        assert_ne!(first.cursor, "0");

        let second = pool.search_keys(cache.id, "user:*", 150, &first.cursor).await.unwrap();
        assert_eq!(second.keys.len(), 150);
        assert!(second.scan_complete);

        let seen: HashSet<String> =
            first.keys.iter().chain(&second.keys).map(|k| k.key.clone()).collect();
        assert_eq!(seen.len(), 250);
        assert!(seen.iter().all(|k| k.starts_with("user:")));
    }

    #[tokio::test]
    async fn test_key_scan_with_fixed_limit_takes_three_pages() {
        let cache = key_value_config("cache");
        let (pool, connector) = pool_with(vec![cache.clone()], FakeConnector::new());
        connector.backend().seed_keys((0..250).map(|i| format!("user:{i:03}")));

        let mut cursor = String::new();
        let mut sizes = Vec::new();
        let mut seen = HashSet::new();
        loop {
            let page = pool.search_keys(cache.id, "user:*", 100, &cursor).await.unwrap();
            sizes.push(page.keys.len());
            seen.extend(page.keys.into_iter().map(|k| k.key));
            if page.scan_complete {
                break;
            }
            cursor = page.cursor;
        }

        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(seen.len(), 250);
    }

    #[tokio::test]
    async fn test_key_details_report_no_expiry_as_minus_one() {
        let cache = key_value_config("cache");
        let (pool, _) = pool_with(vec![cache.clone()], FakeConnector::new());

        let fields = [("name".to_string(), "alice".to_string())].into();
        pool.set_hash(cache.id, "user:1", fields, None).await.unwrap();
        assert_eq!(pool.get_key_details(cache.id, "user:1").await.unwrap().ttl, -1);

        pool.update_ttl(cache.id, "user:1", Some(60)).await.unwrap();
        assert_eq!(pool.get_key_details(cache.id, "user:1").await.unwrap().ttl, 60);

        pool.update_ttl(cache.id, "user:1", None).await.unwrap();
        assert_eq!(pool.get_key_details(cache.id, "user:1").await.unwrap().ttl, -1);

        let err = pool.get_key_details(cache.id, "user:2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    // =========================================================================
    // Filtered paging against a real file database
    // =========================================================================

    #[tokio::test]
    async fn test_filtered_page_on_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);")
                .unwrap();
            for id in 1..=20 {
                conn.execute(
                    "INSERT INTO users (id, name) VALUES (?1, ?2)",
                    rusqlite::params![id, format!("user{id}")],
                )
                .unwrap();
            }
        }

        let config = ConnectionConfig::builder(BackendKind::FileBased)
            .name("local")
            .file_path(&path)
            .build()
            .unwrap();
        let pool = PoolManager::new(
            Arc::new(MemoryCatalog::with_configs([config.clone()])),
            Arc::new(NativeConnector::new()),
        );

        let req = TableDataRequest::new("public", "users").page(1, 100).filter("id = 5");
        let page = pool.get_table_data(config.id, req).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 100);
        assert_eq!(page.data, vec![json!({ "id": 5, "name": "user5" })]);

        let result = pool.execute_query(config.id, "SELECT * FROM missing_table").await.unwrap();
        assert!(result.error.unwrap().contains("missing_table"));
        assert_eq!(pool.status(config.id).status, ConnectionStatus::Connected);

        pool.shutdown().await;
    }

    // =========================================================================
    // Statement failures are data, not errors
    // =========================================================================

    #[tokio::test]
    async fn test_division_by_zero_is_returned_in_band() {
        let config = relational_config("pg");
        let (pool, _) = pool_with(vec![config.clone()], FakeConnector::new());

        let result = pool.execute_query(config.id, "SELECT 1/0").await.unwrap();
        assert!(result.data.is_empty());
        assert_eq!(result.row_count, 0);
        assert_eq!(result.error.as_deref(), Some("division by zero"));

        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["data"], json!([]));
        assert_eq!(wire["row_count"], 0);
        assert_eq!(wire["error"], "division by zero");
    }

    // =========================================================================
    // Source layout
    // =========================================================================

    fn rust_sources(dir: &std::path::Path, out: &mut Vec<std::path::PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                rust_sources(&path, out);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                out.push(path);
            }
        }
    }

    #[test]
    fn test_source_lines_fit_rustfmt_width() {
        let crates = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
        let mut files = Vec::new();
        rust_sources(&crates.join("quarry_core/src"), &mut files);
        rust_sources(&crates.join("quarry/src"), &mut files);
        assert!(files.len() > 20);

        let mut long = Vec::new();
        for file in &files {
            let text = std::fs::read_to_string(file).unwrap();
            for (n, line) in text.lines().enumerate() {
                if line.chars().count() > 100 {
                    long.push(format!("{}:{}", file.display(), n + 1));
                }
            }
        }
        assert!(long.is_empty(), "lines over 100 columns: {long:#?}");
    }
}
