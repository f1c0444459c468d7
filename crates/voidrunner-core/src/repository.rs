//! Repository contracts
//!
//! Persistence is owned by `voidrunner-db`; the worker pool and the
//! execution service only ever see these traits, which keeps the
//! pipeline testable against in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    CreateTaskRequest, ExecutionOutcome, Task, TaskExecution, TaskListQuery, TaskStatus,
    UpdateTaskRequest, User,
};

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, user_id: Uuid, req: CreateTaskRequest) -> Result<Task, AppError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError>;

    /// Owner-scoped fetch; `None` covers both unknown and foreign ids so
    /// handlers can 404 without leaking existence.
    async fn get_task_for_user(
        &self,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Task>, AppError>;

    async fn list_tasks(&self, user_id: Uuid, query: TaskListQuery) -> Result<Vec<Task>, AppError>;

    async fn update_task(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        req: UpdateTaskRequest,
    ) -> Result<Task, AppError>;

    /// Compare-and-swap status transition. Returns `false` when the row
    /// was not in `expected` (someone else already moved it).
    async fn transition_status(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, AppError>;

    /// Re-run back-edge: returns a finished task (completed, timeout or
    /// cancelled, never failed) to `pending` so a new execution can be
    /// attempted. `false` when the task was not in one of those states.
    async fn requeue_task(&self, task_id: Uuid) -> Result<bool, AppError>;

    /// Deletes the task and its execution history in one transaction.
    /// Fails with `conflict` while an execution is pending or running.
    async fn delete_task(&self, user_id: Uuid, task_id: Uuid) -> Result<(), AppError>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Inserts a pending execution. Fails with `conflict` when the task
    /// already has a pending or running execution (at most one active
    /// attempt per task).
    async fn create_execution(&self, task_id: Uuid) -> Result<TaskExecution, AppError>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<TaskExecution>, AppError>;

    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<TaskExecution>, AppError>;

    /// Most recent execution for the task, if any.
    async fn latest_execution(&self, task_id: Uuid) -> Result<Option<TaskExecution>, AppError>;

    /// CAS `pending -> running`, stamping `started_at`. `false` when the
    /// row already left `pending`.
    async fn mark_running(&self, execution_id: Uuid) -> Result<bool, AppError>;

    /// Moves an active execution to the outcome's terminal status with
    /// outputs and `completed_at`. Idempotent: `false` when the row was
    /// already terminal, in which case nothing changes.
    async fn finish_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<bool, AppError>;

    /// Late-arriving metrics; the only mutation allowed on terminal rows.
    async fn record_metrics(
        &self,
        execution_id: Uuid,
        execution_time_ms: Option<i64>,
        memory_usage_bytes: Option<i64>,
    ) -> Result<(), AppError>;

    /// Hard-deletes an execution row (admin path).
    async fn delete_execution(&self, execution_id: Uuid) -> Result<(), AppError>;

    /// Executions stuck in `running` whose `started_at` is older than the
    /// cutoff; candidates for the stale reaper.
    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskExecution>, AppError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<User, AppError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError>;
}
