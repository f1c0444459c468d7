//! Execution endpoints, delegating to the execution service.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use voidrunner_core::models::ExecutionResponse;

use crate::auth::AuthUser;
use crate::error::HttpAppError;
use crate::services::UpdateExecutionRequest;
use crate::state::AppState;

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn create_execution(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ExecutionResponse>), HttpAppError> {
    let execution = state
        .execution_service
        .create_execution(task_id, user.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(execution.into())))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn list_executions(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let executions = state
        .execution_service
        .list_executions_for_task(task_id, user.user_id)
        .await?;
    let responses: Vec<ExecutionResponse> =
        executions.into_iter().map(ExecutionResponse::from).collect();
    Ok(Json(serde_json::json!({
        "executions": responses,
        "count": responses.len(),
    })))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn get_execution(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionResponse>, HttpAppError> {
    let execution = state
        .execution_service
        .get_execution_for_user(execution_id, user.user_id)
        .await?;
    Ok(Json(execution.into()))
}

/// Worker/admin path: guarded state-machine update.
#[tracing::instrument(skip(state, req), fields(user_id = %user.user_id))]
pub async fn update_execution(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
    Json(req): Json<UpdateExecutionRequest>,
) -> Result<Json<ExecutionResponse>, HttpAppError> {
    // Ownership check first so foreign executions 403 before any write.
    state
        .execution_service
        .get_execution_for_user(execution_id, user.user_id)
        .await?;
    let execution = state
        .execution_service
        .update_execution(execution_id, req)
        .await?;
    Ok(Json(execution.into()))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn cancel_execution(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionResponse>, HttpAppError> {
    let execution = state
        .execution_service
        .cancel_execution(execution_id, user.user_id)
        .await?;
    Ok(Json(execution.into()))
}
