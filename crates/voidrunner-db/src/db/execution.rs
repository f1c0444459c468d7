use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use voidrunner_core::error::AppError;
use voidrunner_core::models::{ExecutionOutcome, TaskExecution};
use voidrunner_core::repository::ExecutionRepository;

use crate::db::is_unique_violation;

const EXECUTION_COLUMNS: &str = r#"
    id,
    task_id,
    status,
    return_code,
    stdout,
    stderr,
    execution_time_ms,
    memory_usage_bytes,
    started_at,
    completed_at,
    created_at
"#;

#[derive(Clone)]
pub struct PgExecutionRepository {
    pool: PgPool,
}

impl PgExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    #[tracing::instrument(skip(self))]
    async fn create_execution(&self, task_id: Uuid) -> Result<TaskExecution, AppError> {
        // The partial unique index on (task_id) WHERE active backs this
        // up; the guarded insert keeps the common path conflict-free.
        let inserted = sqlx::query_as::<Postgres, TaskExecution>(&format!(
            r#"
            INSERT INTO task_executions (task_id, status)
            SELECT $1, 'pending'
            WHERE NOT EXISTS (
                SELECT 1 FROM task_executions
                WHERE task_id = $1 AND status IN ('pending', 'running')
            )
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!("task {} already has an active execution", task_id))
            } else {
                tracing::error!(error = %e, task_id = %task_id, "Failed to insert execution");
                AppError::Database(e)
            }
        })?;

        match inserted {
            Some(execution) => {
                tracing::info!(
                    execution_id = %execution.id,
                    task_id = %task_id,
                    "Execution created"
                );
                Ok(execution)
            }
            None => Err(AppError::Conflict(format!(
                "task {} already has an active execution",
                task_id
            ))),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<TaskExecution>, AppError> {
        let execution = sqlx::query_as::<Postgres, TaskExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(execution)
    }

    #[tracing::instrument(skip(self))]
    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<TaskExecution>, AppError> {
        let executions = sqlx::query_as::<Postgres, TaskExecution>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM task_executions
            WHERE task_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(executions)
    }

    #[tracing::instrument(skip(self))]
    async fn latest_execution(&self, task_id: Uuid) -> Result<Option<TaskExecution>, AppError> {
        let execution = sqlx::query_as::<Postgres, TaskExecution>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM task_executions
            WHERE task_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(execution)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_running(&self, execution_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'running', started_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, outcome), fields(status = %outcome.status))]
    async fn finish_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<bool, AppError> {
        if !outcome.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "finish_execution requires a terminal status, got {}",
                outcome.status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = $2,
                return_code = $3,
                stdout = $4,
                stderr = $5,
                execution_time_ms = $6,
                memory_usage_bytes = $7,
                started_at = COALESCE(started_at, now()),
                completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(execution_id)
        .bind(outcome.status.to_string())
        .bind(outcome.return_code)
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(outcome.execution_time_ms)
        .bind(outcome.memory_usage_bytes)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let finished = result.rows_affected() == 1;
        if finished {
            tracing::info!(
                execution_id = %execution_id,
                status = %outcome.status,
                return_code = ?outcome.return_code,
                "Execution finished"
            );
        } else {
            tracing::debug!(
                execution_id = %execution_id,
                "finish_execution was a no-op, row already terminal"
            );
        }
        Ok(finished)
    }

    #[tracing::instrument(skip(self))]
    async fn record_metrics(
        &self,
        execution_id: Uuid,
        execution_time_ms: Option<i64>,
        memory_usage_bytes: Option<i64>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE task_executions
            SET execution_time_ms = COALESCE($2, execution_time_ms),
                memory_usage_bytes = COALESCE($3, memory_usage_bytes)
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(execution_time_ms)
        .bind(memory_usage_bytes)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_execution(&self, execution_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM task_executions WHERE id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Execution {} not found",
                execution_id
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskExecution>, AppError> {
        let executions = sqlx::query_as::<Postgres, TaskExecution>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM task_executions
            WHERE status = 'running' AND started_at < $1
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(executions)
    }
}
