//! Task CRUD handlers. All routes are owner-scoped through [`AuthUser`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use voidrunner_core::models::{
    CreateTaskRequest, TaskListQuery, TaskResponse, UpdateTaskRequest,
};
use voidrunner_core::validation::{
    validate_create_task, validate_priority, validate_timeout_seconds,
};
use voidrunner_core::AppError;

use crate::auth::AuthUser;
use crate::error::HttpAppError;
use crate::state::AppState;

#[tracing::instrument(skip(state, req), fields(user_id = %user.user_id))]
pub async fn create_task(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), HttpAppError> {
    validate_create_task(&req, state.config.limits.max_script_bytes)?;

    let task = state.tasks.create_task(user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(task.into())))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn list_tasks(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let tasks = state.tasks.list_tasks(user.user_id, query).await?;
    let responses: Vec<TaskResponse> = tasks.into_iter().map(TaskResponse::from).collect();
    Ok(Json(serde_json::json!({
        "tasks": responses,
        "count": responses.len(),
    })))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn get_task(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    let task = state
        .tasks
        .get_task_for_user(user.user_id, task_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
    Ok(Json(task.into()))
}

#[tracing::instrument(skip(state, req), fields(user_id = %user.user_id))]
pub async fn update_task(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    if let Some(priority) = req.priority {
        validate_priority(priority)?;
    }
    if let Some(timeout) = req.timeout_seconds {
        validate_timeout_seconds(timeout)?;
    }

    let task = state.tasks.update_task(user.user_id, task_id, req).await?;
    Ok(Json(task.into()))
}

#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn delete_task(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, HttpAppError> {
    state.tasks.delete_task(user.user_id, task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
