use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use voidrunner_core::error::AppError;
use voidrunner_core::models::{
    CreateTaskRequest, Task, TaskListQuery, TaskStatus, UpdateTaskRequest,
};
use voidrunner_core::repository::TaskRepository;

const TASK_COLUMNS: &str = r#"
    id,
    user_id,
    name,
    description,
    script_content,
    script_type,
    status,
    priority,
    timeout_seconds,
    metadata,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    #[tracing::instrument(skip(self, req))]
    async fn create_task(&self, user_id: Uuid, req: CreateTaskRequest) -> Result<Task, AppError> {
        let task: Task = sqlx::query_as::<Postgres, Task>(&format!(
            r#"
            INSERT INTO tasks (user_id, name, description, script_content, script_type, priority, timeout_seconds, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {TASK_COLUMNS}
            "#,
        ))
        .bind(user_id)
        .bind(&req.name)
        .bind(&req.description)
        .bind(&req.script_content)
        .bind(req.script_type.to_string())
        .bind(req.priority.unwrap_or(5))
        .bind(req.timeout_seconds.unwrap_or(300))
        .bind(req.metadata.unwrap_or_else(|| serde_json::json!({})))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, user_id = %user_id, "Failed to insert task");
            AppError::Database(e)
        })?;

        tracing::info!(
            task_id = %task.id,
            user_id = %user_id,
            script_type = %task.script_type,
            priority = task.priority,
            "Task created"
        );
        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        let task = sqlx::query_as::<Postgres, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn get_task_for_user(
        &self,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Task>, AppError> {
        let task = sqlx::query_as::<Postgres, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 AND id = $2"
        ))
        .bind(user_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn list_tasks(&self, user_id: Uuid, query: TaskListQuery) -> Result<Vec<Task>, AppError> {
        let limit = query.limit.unwrap_or(50).clamp(1, 1000);
        let offset = query.offset.unwrap_or(0).max(0);

        let tasks = sqlx::query_as::<Postgres, Task>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE user_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR script_type = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(user_id)
        .bind(query.status.map(|s| s.to_string()))
        .bind(query.script_type.map(|t| t.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(tasks)
    }

    #[tracing::instrument(skip(self, req))]
    async fn update_task(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        req: UpdateTaskRequest,
    ) -> Result<Task, AppError> {
        let task = sqlx::query_as::<Postgres, Task>(&format!(
            r#"
            UPDATE tasks SET
                name = COALESCE($3, name),
                description = COALESCE($4, description),
                priority = COALESCE($5, priority),
                timeout_seconds = COALESCE($6, timeout_seconds),
                metadata = COALESCE($7, metadata),
                updated_at = now()
            WHERE user_id = $1 AND id = $2
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(task_id)
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.priority)
        .bind(req.timeout_seconds)
        .bind(&req.metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        task.ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))
    }

    #[tracing::instrument(skip(self))]
    async fn transition_status(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, AppError> {
        if !expected.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "illegal task transition {} -> {}",
                expected, next
            )));
        }

        let result = sqlx::query(
            "UPDATE tasks SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
        )
        .bind(next.to_string())
        .bind(task_id)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let swapped = result.rows_affected() == 1;
        if swapped {
            tracing::debug!(task_id = %task_id, from = %expected, to = %next, "Task status transition");
        }
        Ok(swapped)
    }

    #[tracing::instrument(skip(self))]
    async fn requeue_task(&self, task_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'pending', updated_at = now()
            WHERE id = $1 AND status IN ('completed', 'timeout', 'cancelled')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_task(&self, user_id: Uuid, task_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        let owned: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM tasks WHERE user_id = $1 AND id = $2 FOR UPDATE")
                .bind(user_id)
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::Database)?;
        if owned.is_none() {
            return Err(AppError::NotFound(format!("Task {} not found", task_id)));
        }

        let active: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM task_executions WHERE task_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;
        if active.is_some() {
            return Err(AppError::Conflict(
                "task has an active execution and cannot be deleted".into(),
            ));
        }

        // Execution history goes with the task; there is no schema-level
        // cascade.
        sqlx::query("DELETE FROM task_executions WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        tracing::info!(task_id = %task_id, user_id = %user_id, "Task deleted");
        Ok(())
    }
}
