//! Execution service: the state-machine bridge between the repository
//! and the queue. Owns execution row creation (with the one-active
//! invariant), cancellation, and guarded status updates.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use voidrunner_core::models::{
    ExecutionOutcome, QueueMessage, Task, TaskExecution, TaskStatus,
};
use voidrunner_core::repository::{ExecutionRepository, TaskRepository};
use voidrunner_core::AppError;
use voidrunner_queue::TaskQueue;

/// Body of `PUT /api/v1/executions/{id}` (worker/admin path).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateExecutionRequest {
    pub status: Option<TaskStatus>,
    pub return_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub memory_usage_bytes: Option<i64>,
}

#[derive(Clone)]
pub struct ExecutionService {
    tasks: Arc<dyn TaskRepository>,
    executions: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn TaskQueue>,
    max_attempts: i32,
}

impl ExecutionService {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        executions: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn TaskQueue>,
        max_attempts: i32,
    ) -> Self {
        Self {
            tasks,
            executions,
            queue,
            max_attempts,
        }
    }

    /// Creates a pending execution and enqueues its message.
    ///
    /// Conflicts when the task already has an active execution or sits
    /// in terminal `failed`. Finished tasks (completed/timeout/
    /// cancelled) are moved back to `pending` for the re-run. On queue
    /// failure the freshly inserted row is rolled back.
    #[tracing::instrument(skip(self))]
    pub async fn create_execution(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<TaskExecution, AppError> {
        let task = self
            .tasks
            .get_task_for_user(user_id, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

        if task.status == TaskStatus::Failed {
            return Err(AppError::Conflict(
                "task has terminally failed and cannot be re-executed".into(),
            ));
        }

        let execution = self.executions.create_execution(task_id).await?;

        if task.status.is_terminal() {
            // Re-run back-edge: the task returns to pending for this
            // fresh attempt.
            self.tasks.requeue_task(task_id).await?;
        }

        let msg = QueueMessage::new(task_id, task.priority, self.max_attempts);
        if let Err(queue_err) = self.queue.enqueue(msg).await {
            tracing::warn!(
                task_id = %task_id,
                error = %queue_err,
                "Enqueue failed, rolling back execution row"
            );
            if let Err(rollback_err) = self.executions.delete_execution(execution.id).await {
                tracing::error!(
                    execution_id = %execution.id,
                    error = %rollback_err,
                    "Rollback of execution row failed"
                );
            }
            return Err(queue_err.into());
        }

        tracing::info!(
            execution_id = %execution.id,
            task_id = %task_id,
            "Execution created and enqueued"
        );
        Ok(execution)
    }

    /// Cancels an active execution.
    ///
    /// Pending: the row and task go `cancelled` immediately and the
    /// queue message is removed best-effort (a message that was already
    /// leased resolves as a no-op ack on the worker). Running: the row
    /// and task go `cancelled`; the worker observes the row on its next
    /// heartbeat tick and kills the sandbox.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<TaskExecution, AppError> {
        let (execution, task) = self.get_owned(execution_id, user_id).await?;

        if execution.is_terminal() {
            return Err(AppError::Conflict(format!(
                "execution is already terminal ({})",
                execution.status
            )));
        }

        let was_pending = execution.status == TaskStatus::Pending;
        let outcome = ExecutionOutcome {
            status: TaskStatus::Cancelled,
            return_code: None,
            stdout: String::new(),
            stderr: "cancellation requested".into(),
            execution_time_ms: 0,
            memory_usage_bytes: None,
        };
        self.executions
            .finish_execution(execution.id, &outcome)
            .await?;

        let from = if was_pending {
            TaskStatus::Pending
        } else {
            TaskStatus::Running
        };
        self.tasks
            .transition_status(task.id, from, TaskStatus::Cancelled)
            .await?;

        if was_pending {
            match self.queue.remove(task.id).await {
                Ok(removed) => {
                    tracing::debug!(task_id = %task.id, removed, "Queue removal on cancel")
                }
                Err(e) => {
                    // The cancelled row already guarantees a no-op on
                    // delivery.
                    tracing::warn!(task_id = %task.id, error = %e, "Queue removal failed");
                }
            }
        }

        tracing::info!(execution_id = %execution_id, "Execution cancelled");
        self.executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))
    }

    /// Guarded status update (worker/admin path). Terminal rows accept
    /// only late metrics; anything else is a conflict. Status changes
    /// must follow the execution state machine.
    #[tracing::instrument(skip(self, req))]
    pub async fn update_execution(
        &self,
        execution_id: Uuid,
        req: UpdateExecutionRequest,
    ) -> Result<TaskExecution, AppError> {
        let execution = self
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))?;

        if let Some(next) = req.status {
            if execution.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "execution is terminal ({}); only metrics may be updated",
                    execution.status
                )));
            }
            if !execution.status.can_transition_to(next) {
                return Err(AppError::Conflict(format!(
                    "illegal execution transition {} -> {}",
                    execution.status, next
                )));
            }

            if next == TaskStatus::Running {
                self.executions.mark_running(execution_id).await?;
                self.tasks
                    .transition_status(execution.task_id, TaskStatus::Pending, TaskStatus::Running)
                    .await?;
            } else {
                let outcome = ExecutionOutcome {
                    status: next,
                    return_code: req.return_code,
                    stdout: req.stdout.clone().unwrap_or_default(),
                    stderr: req.stderr.clone().unwrap_or_default(),
                    execution_time_ms: req.execution_time_ms.unwrap_or(0),
                    memory_usage_bytes: req.memory_usage_bytes,
                };
                self.executions
                    .finish_execution(execution_id, &outcome)
                    .await?;
                let moved = self
                    .tasks
                    .transition_status(execution.task_id, TaskStatus::Running, next)
                    .await?;
                if !moved && TaskStatus::Pending.can_transition_to(next) {
                    self.tasks
                        .transition_status(execution.task_id, TaskStatus::Pending, next)
                        .await?;
                }
            }
        } else if req.execution_time_ms.is_some() || req.memory_usage_bytes.is_some() {
            self.executions
                .record_metrics(execution_id, req.execution_time_ms, req.memory_usage_bytes)
                .await?;
        } else {
            return Err(AppError::Validation(
                "update requires a status or metrics".into(),
            ));
        }

        self.executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))
    }

    pub async fn get_execution_for_user(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<TaskExecution, AppError> {
        let (execution, _task) = self.get_owned(execution_id, user_id).await?;
        Ok(execution)
    }

    pub async fn list_executions_for_task(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<TaskExecution>, AppError> {
        self.tasks
            .get_task_for_user(user_id, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
        self.executions.list_executions(task_id).await
    }

    /// Fetches the execution and enforces task ownership: unknown ids
    /// 404, foreign ids 403.
    async fn get_owned(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<(TaskExecution, Task), AppError> {
        let execution = self
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))?;
        let task = self
            .tasks
            .get_task(execution.task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", execution.task_id)))?;
        if task.user_id != user_id {
            return Err(AppError::Forbidden(
                "execution belongs to another user".into(),
            ));
        }
        Ok((execution, task))
    }
}
