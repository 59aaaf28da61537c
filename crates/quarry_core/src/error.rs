//! Error types for the Quarry access layer.
//!
//! Every failure carries a human-readable message. Connection-level failures
//! (authentication, network, tunnel) are distinguished from statement-level
//! failures so the pool can decide whether to demote an entry.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::BackendKind;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the access layer.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// The target database rejected the credentials.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Host unreachable, connection dropped or dial timed out.
    #[error("Network error: {message}")]
    Network {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// SSH jump host dial or authentication failed.
    #[error("SSH tunnel error: {message}")]
    Tunnel {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A kind-specific operation was called on the wrong backend kind.
    #[error("{operation} is not supported for {kind} connections")]
    Unsupported {
        /// Operation name as exposed on the command surface.
        operation: String,
        /// Backend kind of the connection.
        kind: BackendKind,
    },

    /// The call was rejected before any network I/O.
    #[error("{message}")]
    Precondition {
        /// Human-readable error message.
        message: String,
    },

    /// A raw SQL token failed the allow-list check.
    #[error("Invalid raw SQL value '{value}': {reason}")]
    RawSqlRejected {
        /// The rejected raw value (trimmed).
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The backend accepted the call but the statement failed.
    #[error("{message}")]
    Query {
        /// Backend error message.
        message: String,
        /// Additional detail from the backend.
        detail: Option<String>,
        /// Backend hint.
        hint: Option<String>,
        /// Position in the statement (1-indexed).
        position: Option<u32>,
        /// Backend error code (e.g., "22012").
        code: Option<String>,
    },

    /// No saved connection or key with this identifier.
    #[error("{message}")]
    NotFound {
        /// Human-readable error message.
        message: String,
    },

    /// Malformed arguments.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Local catalog error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// OS keychain error.
    #[error("Credential error: {message}")]
    Credential {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl QuarryError {
    // ========== Constructors ==========

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create a new authentication error with custom hint.
    pub fn authentication_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Authentication { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a new network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into(), hint: None, source: None }
    }

    /// Create a new network error with a hint.
    pub fn network_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Network { message: message.into(), hint: Some(hint.into()), source: None }
    }

    /// Create a new network error with source.
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a new tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), hint: None, source: None }
    }

    /// Create a new tunnel error with a hint.
    pub fn tunnel_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), hint: Some(hint.into()), source: None }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>, kind: BackendKind) -> Self {
        Self::Unsupported { operation: operation.into(), kind }
    }

    /// Create a precondition failure.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition { message: message.into() }
    }

    /// Create a raw SQL rejection.
    pub fn raw_sql_rejected(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RawSqlRejected { value: value.into(), reason: reason.into() }
    }

    /// Create a statement error with only a message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            code: None,
        }
    }

    /// Create a not-found error for a connection id.
    pub fn connection_not_found(id: Uuid) -> Self {
        Self::NotFound { message: format!("Connection not found: {id}") }
    }

    /// Create a generic not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new credential error.
    pub fn credential(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Credential { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// True for failures that mean the session itself is unusable.
    ///
    /// The pool marks an entry disconnected when a delegated operation
    /// returns one of these.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::Network { .. } | Self::Tunnel { .. })
    }

    /// Get the wire category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Network { .. } => ErrorKind::Network,
            Self::Tunnel { .. } => ErrorKind::Tunnel,
            Self::Unsupported { .. } => ErrorKind::UnsupportedOperation,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::RawSqlRejected { .. } => ErrorKind::RawSqlRejected,
            Self::Query { .. } => ErrorKind::Query,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Credential { .. } => ErrorKind::Credential,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "Authentication",
            Self::Network { .. } => "Network",
            Self::Tunnel { .. } => "SSH",
            Self::Unsupported { .. } => "Unsupported",
            Self::Precondition { .. } => "Precondition",
            Self::RawSqlRejected { .. } => "Raw SQL",
            Self::Query { .. } => "Query",
            Self::NotFound { .. } => "Not Found",
            Self::Validation { .. } => "Validation",
            Self::Storage { .. } => "Storage",
            Self::Credential { .. } => "Credential",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Network { hint, .. } => {
                hint.as_deref().or(Some("Check that the database server is running and reachable"))
            }
            Self::Tunnel { hint, .. } => hint.as_deref().or(Some("Check the SSH host settings")),
            Self::Unsupported { .. } => None,
            Self::Precondition { .. } => None,
            Self::RawSqlRejected { .. } => {
                Some("Only predefined SQL functions are allowed as raw values")
            }
            Self::Query { hint, .. } => hint.as_deref(),
            Self::NotFound { .. } => None,
            Self::Validation { .. } => None,
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Credential { hint, .. } => hint.as_deref(),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }
}

/// Error category for callers of the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    /// Bad credentials on the target database
    Authentication,
    /// Host unreachable or timed out
    Network,
    /// SSH dial or authentication failure
    Tunnel,
    /// Kind-specific operation on the wrong kind
    UnsupportedOperation,
    /// Rejected before any network I/O
    Precondition,
    /// Raw SQL token not on the allow-list
    RawSqlRejected,
    /// Statement-level backend failure
    Query,
    /// Unknown connection or key
    NotFound,
    /// Malformed arguments
    Validation,
    /// Local catalog failure
    Storage,
    /// Keychain failure
    Credential,
    /// Unexpected internal error
    Internal,
}

/// Structured error payload as it crosses the command surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional technical detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Actionable suggestion for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Character position in SQL (for syntax errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// Backend error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&QuarryError> for ErrorResponse {
    fn from(err: &QuarryError) -> Self {
        let (detail, position, code) = match err {
            QuarryError::Query { detail, position, code, .. } => {
                (detail.clone(), *position, code.clone())
            }
            _ => (None, None, None),
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            detail,
            hint: err.hint().map(String::from),
            position,
            code,
        }
    }
}

impl From<QuarryError> for ErrorResponse {
    fn from(err: QuarryError) -> Self {
        Self::from(&err)
    }
}

/// Result alias used throughout the crate.
pub type QuarryResult<T> = Result<T, QuarryError>;

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to QuarryError.
impl From<tokio_postgres::Error> for QuarryError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            if code_str.starts_with("28") {
                return QuarryError::Authentication {
                    message,
                    hint: Some("Invalid credentials - check username and password".to_string()),
                };
            }
            if code_str.starts_with("08") || code_str == "57P01" {
                return QuarryError::Network {
                    message,
                    hint: None,
                    source: Some(Box::new(err)),
                };
            }

            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            return QuarryError::Query {
                message,
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                position,
                code: Some(code_str.to_string()),
            };
        }

        if err.is_closed() {
            return QuarryError::Network {
                message: "Connection closed".to_string(),
                hint: Some(
                    "The server closed the connection. It will be re-established on the next call"
                        .to_string(),
                ),
                source: Some(Box::new(err)),
            };
        }

        QuarryError::Network { message: err.to_string(), hint: None, source: Some(Box::new(err)) }
    }
}

/// Convert from deadpool_postgres::PoolError to QuarryError.
impl From<deadpool_postgres::PoolError> for QuarryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => e.into(),
            deadpool_postgres::PoolError::Timeout(_) => QuarryError::network_with_hint(
                format!("Timed out waiting for a database connection: {err}"),
                "The server may be overloaded or unreachable",
            ),
            deadpool_postgres::PoolError::Closed => {
                QuarryError::network("The connection pool has been closed")
            }
            other => QuarryError::internal(format!("Connection pool error: {other}")),
        }
    }
}

/// Convert from rusqlite::Error to QuarryError.
impl From<rusqlite::Error> for QuarryError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::CannotOpen =>
            {
                QuarryError::Network {
                    message: err.to_string(),
                    hint: Some("Check that the database file exists and is readable".to_string()),
                    source: Some(Box::new(err)),
                }
            }
            _ => QuarryError::query(err.to_string()),
        }
    }
}

/// Convert from redis::RedisError to QuarryError.
impl From<redis::RedisError> for QuarryError {
    fn from(err: redis::RedisError) -> Self {
        let auth_failure = err.kind() == redis::ErrorKind::AuthenticationFailed
            || matches!(err.code(), Some("NOAUTH") | Some("WRONGPASS"));
        if auth_failure {
            return QuarryError::authentication_with_hint(
                err.to_string(),
                "Check the Redis password in the connection settings",
            );
        }
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            return QuarryError::network_with_source(err.to_string(), err);
        }
        QuarryError::query(err.to_string())
    }
}

/// Convert from reqwest::Error to QuarryError.
impl From<reqwest::Error> for QuarryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return QuarryError::network_with_source(err.to_string(), err);
        }
        QuarryError::query(err.to_string())
    }
}

/// Convert from russh::Error to QuarryError.
impl From<russh::Error> for QuarryError {
    fn from(err: russh::Error) -> Self {
        QuarryError::Tunnel { message: err.to_string(), hint: None, source: Some(Box::new(err)) }
    }
}

/// Convert from keyring::Error to QuarryError.
impl From<keyring::Error> for QuarryError {
    fn from(err: keyring::Error) -> Self {
        QuarryError::Credential {
            message: err.to_string(),
            hint: Some("Grant Quarry access to the system keychain".to_string()),
        }
    }
}

/// Convert from std::io::Error to QuarryError.
impl From<std::io::Error> for QuarryError {
    fn from(err: std::io::Error) -> Self {
        QuarryError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to QuarryError.
impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self {
        QuarryError::validation(format!("Invalid JSON: {err}"))
    }
}
