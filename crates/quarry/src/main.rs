//! Quarry - JSON-lines front end for the connection pool.
//!
//! Reads one request per line on stdin and writes one response per line on
//! stdout. Logs go to stderr and the log directory, never to stdout.
//!
//! ```text
//! -> {"id": 1, "command": "pool_connect", "args": {"uuid": "..."}}
//! <- {"id": 1, "ok": true, "result": {"status": "connected"}}
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use quarry_core::commands::dispatch;
use quarry_core::logging::{init_logging, LogConfig};
use quarry_core::services::catalog::{default_data_dir, init_data_dir};
use quarry_core::services::credentials::default_secret_store;
use quarry_core::{
    ErrorResponse, HealthMonitor, NativeConnector, PoolManager, QuarryError, SqliteCatalog,
};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    command: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorResponse>,
}

impl Response {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { id, ok: true, result: Some(result), error: None }
    }

    fn failure(id: Option<Value>, error: &QuarryError) -> Self {
        Self { id, ok: false, result: None, error: Some(ErrorResponse::from(error)) }
    }

    fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(e) => format!(r#"{{"ok":false,"error":{{"kind":"Internal","message":"{e}"}}}}"#),
        }
    }
}

/// Serve Quarry pool commands as JSON lines on stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "quarry", version, about)]
struct Args {
    /// Directory for the connection catalog and logs
    #[arg(long, env = "QUARRY_DATA_DIR", value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Log filter directive, overriding QUARRY_LOG and RUST_LOG
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,
}

impl Args {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    fn log_config(&self, data_dir: &std::path::Path) -> LogConfig {
        let config = LogConfig::new(data_dir.join("logs")).with_stderr();
        match &self.log_filter {
            Some(filter) => config.with_filter(filter.clone()),
            None => config,
        }
    }
}

async fn handle_line(pool: &PoolManager, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            let error = QuarryError::validation(format!("Malformed request: {e}"));
            return Response::failure(None, &error);
        }
    };

    match dispatch(pool, &request.command, request.args).await {
        Ok(result) => Response::success(request.id, result),
        Err(e) => {
            tracing::debug!(
                command = %request.command,
                kind = ?e.kind(),
                error = %e,
                "Command failed"
            );
            Response::failure(request.id, &e)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let data_dir = args.data_dir();
    let _logging_guard = init_logging(args.log_config(&data_dir));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        "Starting Quarry"
    );

    if let Err(e) = init_data_dir(&data_dir) {
        tracing::error!(error = %e, "Failed to prepare data directory");
        return ExitCode::FAILURE;
    }
    let catalog = match SqliteCatalog::open(&data_dir, default_secret_store()) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open connection catalog");
            return ExitCode::FAILURE;
        }
    };

    let pool = PoolManager::new(Arc::new(catalog), Arc::new(NativeConnector::new()));
    let health = HealthMonitor::spawn(Arc::clone(&pool));

    // Requests run concurrently; a single writer keeps response lines whole.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                tracing::warn!("stdout closed, dropping responses");
                break;
            }
        }
    });

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let pool = Arc::clone(&pool);
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let response = handle_line(&pool, &line).await;
                    let _ = tx.send(response.to_line());
                });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        }
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;

    health.shutdown();
    pool.shutdown().await;
    tracing::info!("Quarry stopped");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::MemoryCatalog;
    use serde_json::json;

    fn empty_pool() -> Arc<PoolManager> {
        PoolManager::new(Arc::new(MemoryCatalog::new()), Arc::new(NativeConnector::new()))
    }

    #[test]
    fn test_args_accept_data_dir_and_filter() {
        let argv = ["quarry", "--data-dir", "/var/lib/quarry", "--log-filter", "warn"];
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.data_dir(), PathBuf::from("/var/lib/quarry"));

        let log_config = args.log_config(&args.data_dir());
        assert_eq!(log_config.log_filter.as_deref(), Some("warn"));
        assert_eq!(log_config.log_dir, PathBuf::from("/var/lib/quarry/logs"));

        let args = Args::try_parse_from(["quarry", "--data-dir=/tmp/q"]).unwrap();
        assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/q")));
    }

    #[test]
    fn test_args_reject_unknown_flags() {
        let err = Args::try_parse_from(["quarry", "--datadir", "/tmp/q"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);

        let err = Args::try_parse_from(["quarry", "--data-dir"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[tokio::test]
    async fn test_malformed_line_is_validation_error() {
        let response = handle_line(&empty_pool(), "{not json").await;
        assert!(!response.ok);
        let wire: Value = serde_json::from_str(&response.to_line()).unwrap();
        assert_eq!(wire["error"]["kind"], "Validation");
        assert!(wire.get("id").is_none());
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let pool = empty_pool();
        let line = json!({ "id": 7, "command": "get_connections" }).to_string();
        let wire: Value = serde_json::from_str(&handle_line(&pool, &line).await.to_line()).unwrap();
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["ok"], true);
        assert_eq!(wire["result"], json!([]));

        let line = json!({ "id": "a", "command": "no_such_command", "args": {} }).to_string();
        let wire: Value = serde_json::from_str(&handle_line(&pool, &line).await.to_line()).unwrap();
        assert_eq!(wire["id"], "a");
        assert_eq!(wire["ok"], false);
        assert_eq!(wire["error"]["kind"], "Validation");
    }

    #[tokio::test]
    async fn test_status_of_unknown_connection() {
        let line = json!({
            "command": "pool_get_status",
            "args": { "uuid": "00000000-0000-0000-0000-000000000000" }
        })
        .to_string();
        let wire: Value =
            serde_json::from_str(&handle_line(&empty_pool(), &line).await.to_line()).unwrap();
        assert_eq!(wire["result"]["status"], "disconnected");
    }
}
