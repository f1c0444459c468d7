//! HTTP error response conversion
//!
//! Handlers return `Result<impl IntoResponse, HttpAppError>`; any
//! `AppError` converts into `HttpAppError` and renders consistently
//! (status code, JSON body, log level).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use voidrunner_core::{AppError, ErrorMetadata, LogLevel};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable kind tag (e.g. "conflict").
    pub code: String,
    /// Whether retrying the same request can succeed.
    pub recoverable: bool,
}

/// Wrapper needed because of the orphan rule: `IntoResponse` is axum's,
/// `AppError` lives in voidrunner-core.
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        })
    }
}

fn log_error(error: &AppError) {
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, code = error.error_code(), "Request failed");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, code = error.error_code(), "Request failed");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, code = error.error_code(), "Request failed");
        }
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let error = &self.0;
        log_error(error);

        let status = StatusCode::from_u16(error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Internal details stay in the logs, not the response body.
        let message = match error {
            AppError::Database(_)
            | AppError::Internal(_)
            | AppError::InternalWithSource { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: message,
            code: error.error_code().to_string(),
            recoverable: error.is_recoverable(),
        };
        (status, Json(body)).into_response()
    }
}
