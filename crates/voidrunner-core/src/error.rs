//! Error types module
//!
//! All errors are unified under the [`AppError`] enum. Each variant
//! carries a stable kind tag (see [`ErrorMetadata::error_code`]) so that
//! the HTTP boundary, the worker and the logs agree on what a failure
//! means.

use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected errors like validation failures
    Debug,
    /// Recoverable issues like resource limits
    Warn,
    /// Unexpected failures
    Error,
}

/// How an error should be presented at the boundary. Implemented by
/// [`AppError`]; the HTTP layer renders responses purely through this.
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Stable machine-readable kind tag (e.g. "conflict")
    fn error_code(&self) -> &'static str;

    /// Whether retrying the same operation can succeed
    fn is_recoverable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[error("Infrastructure unavailable: {0}")]
    TransientInfrastructure(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error: {message}")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::Unauthorized(_) => 401,
            AppError::Forbidden(_) => 403,
            AppError::RateLimited(_) => 429,
            AppError::Database(_) => 500,
            AppError::TransientInfrastructure(_) => 503,
            AppError::ResourceExhausted(_) => 503,
            AppError::ExecutionFailure(_) => 500,
            AppError::Timeout(_) => 504,
            AppError::Cancelled(_) => 409,
            AppError::Internal(_) | AppError::InternalWithSource { .. } => 500,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not-found",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::RateLimited(_) => "rate-limited",
            AppError::Database(_) => "database",
            AppError::TransientInfrastructure(_) => "transient-infrastructure",
            AppError::ResourceExhausted(_) => "resource-exhausted",
            AppError::ExecutionFailure(_) => "execution-failure",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled(_) => "cancelled",
            AppError::Internal(_) | AppError::InternalWithSource { .. } => "internal",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited(_)
                | AppError::TransientInfrastructure(_)
                | AppError::ResourceExhausted(_)
                | AppError::Database(_)
        )
    }

    fn log_level(&self) -> LogLevel {
        match self {
            AppError::Validation(_)
            | AppError::NotFound(_)
            | AppError::Conflict(_)
            | AppError::Unauthorized(_)
            | AppError::Forbidden(_)
            | AppError::Cancelled(_) => LogLevel::Debug,
            AppError::RateLimited(_)
            | AppError::TransientInfrastructure(_)
            | AppError::ResourceExhausted(_)
            | AppError::Timeout(_) => LogLevel::Warn,
            AppError::Database(_)
            | AppError::ExecutionFailure(_)
            | AppError::Internal(_)
            | AppError::InternalWithSource { .. } => LogLevel::Error,
        }
    }
}

impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}
