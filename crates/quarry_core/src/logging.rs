//! Structured logging setup with console and file output.
//!
//! Provides:
//! - Daily rotating log files (`quarry.<date>.log`)
//! - Build-type conditional log levels
//! - Console-only fallback when file logging fails
//! - Environment variable override via QUARRY_LOG or RUST_LOG
//!
//! The binary host speaks JSON on stdout, so it logs to stderr instead.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "QUARRY_LOG";

/// Stream that receives console output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleTarget {
    Stdout,
    Stderr,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether the console stream is a terminal
    pub is_pty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
    /// Console stream
    pub console: ConsoleTarget,
}

impl LogConfig {
    /// Create a new logging configuration writing to stdout.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            is_pty: atty::is(atty::Stream::Stdout),
            log_filter: None,
            console: ConsoleTarget::Stdout,
        }
    }

    /// Send console output to stderr, keeping stdout free for protocol data.
    pub fn with_stderr(mut self) -> Self {
        self.console = ConsoleTarget::Stderr;
        self.is_pty = atty::is(atty::Stream::Stderr);
        self
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    fn console_writer(&self, max_info: bool) -> BoxMakeWriter {
        match (self.console, max_info) {
            (ConsoleTarget::Stdout, true) => {
                BoxMakeWriter::new(std::io::stdout.with_max_level(tracing::Level::INFO))
            }
            (ConsoleTarget::Stdout, false) => BoxMakeWriter::new(std::io::stdout),
            (ConsoleTarget::Stderr, true) => {
                BoxMakeWriter::new(std::io::stderr.with_max_level(tracing::Level::INFO))
            }
            (ConsoleTarget::Stderr, false) => BoxMakeWriter::new(std::io::stderr),
        }
    }
}

/// Guard that must be held for the lifetime of the process.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Initialize logging with the given configuration.
///
/// Interactive terminals get console-only output. If the log directory cannot
/// be used, falls back to console-only as well.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_pty {
        return init_console_logging(&config);
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {}. Using console only.", e);
            init_console_logging(&config)
        }
    }
}

fn init_console_logging(config: &LogConfig) -> LoggingGuard {
    let env_filter = build_env_filter(config.log_filter.as_deref());

    // A subscriber may already be installed (embedding, tests).
    let _ = tracing_subscriber::fmt()
        .with_writer(config.console_writer(false))
        .with_env_filter(env_filter)
        .with_ansi(config.is_pty)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();

    LoggingGuard { _worker_guard: None }
}

fn init_file_logging(
    config: &LogConfig,
) -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("quarry")
        .filename_suffix("log")
        .build(&config.log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let combined = config.console_writer(true).and(non_blocking);

    let env_filter = build_env_filter(config.log_filter.as_deref());

    tracing_subscriber::fmt()
        .with_writer(combined)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()?;

    Ok(guard)
}

/// Build the filter. Priority: custom filter > QUARRY_LOG > RUST_LOG > default.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        concat!(
            "debug,quarry=trace,quarry_core=trace,",
            "tokio_postgres=warn,russh=info,hyper=warn,reqwest=warn"
        )
    }
    #[cfg(not(debug_assertions))]
    {
        "info,quarry=info,quarry_core=info,tokio_postgres=warn,russh=warn,hyper=warn,reqwest=warn"
    }
}

/// Get the default log directory.
pub fn log_dir() -> PathBuf {
    crate::services::catalog::default_data_dir().join("logs")
}
