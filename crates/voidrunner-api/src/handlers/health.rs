//! Liveness, readiness and operational stats.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};

use crate::error::HttpAppError;
use crate::state::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Readiness: database, broker and container runtime probes. 503 with
/// per-dependency detail when any probe fails.
#[tracing::instrument(skip(state))]
pub async fn ready(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), HttpAppError> {
    let database_ok = match &state.db_pool {
        Some(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        None => true,
    };
    let queue_ok = state.queue.ping().await.is_ok();
    let executor_ok = state.executor.is_healthy().await;

    let ready = database_ok && queue_ok && executor_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "degraded" },
            "database": database_ok,
            "queue": queue_ok,
            "executor": executor_ok,
        })),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let depths = state
        .queue
        .depths()
        .await
        .map_err(voidrunner_core::AppError::from)?;
    Ok(Json(serde_json::json!({
        "primary": depths.primary,
        "retry": depths.retry,
        "dead_letter": depths.dead,
        "inflight": depths.inflight,
    })))
}

/// Dead-letter inspection: terminal envelopes, oldest first, capped.
#[tracing::instrument(skip(state))]
pub async fn dead_letters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let messages = state
        .queue
        .dead_letters(100)
        .await
        .map_err(voidrunner_core::AppError::from)?;
    Ok(Json(serde_json::json!({
        "count": messages.len(),
        "messages": messages,
    })))
}

#[tracing::instrument(skip(state))]
pub async fn worker_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    match &state.worker_manager {
        Some(manager) => {
            let status = manager.status().await;
            Ok(Json(serde_json::to_value(status).map_err(|e| {
                voidrunner_core::AppError::Internal(e.to_string())
            })?))
        }
        None => Ok(Json(serde_json::json!({ "pool_size": 0, "workers": [] }))),
    }
}
