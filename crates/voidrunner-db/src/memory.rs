//! In-memory store implementing every repository contract.
//!
//! Used by unit and integration tests and by local development without
//! Postgres. Semantics mirror the Pg implementations, including the
//! single-active-execution conflict and compare-and-swap transitions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use voidrunner_core::error::AppError;
use voidrunner_core::models::{
    CreateTaskRequest, ExecutionOutcome, Task, TaskExecution, TaskListQuery, TaskStatus,
    UpdateTaskRequest, User,
};
use voidrunner_core::repository::{ExecutionRepository, TaskRepository, UserRepository};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    tasks: HashMap<Uuid, Task>,
    executions: HashMap<Uuid, TaskExecution>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: number of executions recorded for a task.
    pub async fn execution_count(&self, task_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.task_id == task_id)
            .count()
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn create_task(&self, user_id: Uuid, req: CreateTaskRequest) -> Result<Task, AppError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            user_id,
            name: req.name,
            description: req.description,
            script_content: req.script_content,
            script_type: req.script_type,
            status: TaskStatus::Pending,
            priority: req.priority.unwrap_or(5),
            timeout_seconds: req.timeout_seconds.unwrap_or(300),
            metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn get_task_for_user(
        &self,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Task>, AppError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .get(&task_id)
            .filter(|t| t.user_id == user_id)
            .cloned())
    }

    async fn list_tasks(&self, user_id: Uuid, query: TaskListQuery) -> Result<Vec<Task>, AppError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| query.status.map_or(true, |s| t.status == s))
            .filter(|t| query.script_type.map_or(true, |l| t.script_type == l))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.unwrap_or(50).clamp(1, 1000) as usize;
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_task(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        req: UpdateTaskRequest,
    ) -> Result<Task, AppError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
        if let Some(name) = req.name {
            task.name = name;
        }
        if let Some(description) = req.description {
            task.description = Some(description);
        }
        if let Some(priority) = req.priority {
            task.priority = priority;
        }
        if let Some(timeout) = req.timeout_seconds {
            task.timeout_seconds = timeout;
        }
        if let Some(metadata) = req.metadata {
            task.metadata = metadata;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

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
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.status == expected => {
                task.status = next;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_task(&self, task_id: Uuid) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task_id) {
            Some(task)
                if matches!(
                    task.status,
                    TaskStatus::Completed | TaskStatus::Timeout | TaskStatus::Cancelled
                ) =>
            {
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_task(&self, user_id: Uuid, task_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get(&task_id) {
            Some(task) if task.user_id == user_id => {}
            _ => return Err(AppError::NotFound(format!("Task {} not found", task_id))),
        }
        let has_active = inner
            .executions
            .values()
            .any(|e| e.task_id == task_id && e.is_active());
        if has_active {
            return Err(AppError::Conflict(
                "task has an active execution and cannot be deleted".into(),
            ));
        }
        inner.executions.retain(|_, e| e.task_id != task_id);
        inner.tasks.remove(&task_id);
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryStore {
    async fn create_execution(&self, task_id: Uuid) -> Result<TaskExecution, AppError> {
        let mut inner = self.inner.write().await;
        let has_active = inner
            .executions
            .values()
            .any(|e| e.task_id == task_id && e.is_active());
        if has_active {
            return Err(AppError::Conflict(format!(
                "task {} already has an active execution",
                task_id
            )));
        }
        let execution = TaskExecution {
            id: Uuid::new_v4(),
            task_id,
            status: TaskStatus::Pending,
            return_code: None,
            stdout: None,
            stderr: None,
            execution_time_ms: None,
            memory_usage_bytes: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        inner.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<TaskExecution>, AppError> {
        Ok(self.inner.read().await.executions.get(&execution_id).cloned())
    }

    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<TaskExecution>, AppError> {
        let inner = self.inner.read().await;
        let mut executions: Vec<TaskExecution> = inner
            .executions
            .values()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    async fn latest_execution(&self, task_id: Uuid) -> Result<Option<TaskExecution>, AppError> {
        Ok(self.list_executions(task_id).await?.into_iter().next())
    }

    async fn mark_running(&self, execution_id: Uuid) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        match inner.executions.get_mut(&execution_id) {
            Some(e) if e.status == TaskStatus::Pending => {
                e.status = TaskStatus::Running;
                e.started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

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
        let mut inner = self.inner.write().await;
        match inner.executions.get_mut(&execution_id) {
            Some(e) if e.is_active() => {
                e.status = outcome.status;
                e.return_code = outcome.return_code;
                e.stdout = Some(outcome.stdout.clone());
                e.stderr = Some(outcome.stderr.clone());
                e.execution_time_ms = Some(outcome.execution_time_ms);
                e.memory_usage_bytes = outcome.memory_usage_bytes;
                e.started_at.get_or_insert_with(Utc::now);
                e.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_metrics(
        &self,
        execution_id: Uuid,
        execution_time_ms: Option<i64>,
        memory_usage_bytes: Option<i64>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if let Some(e) = inner.executions.get_mut(&execution_id) {
            if execution_time_ms.is_some() {
                e.execution_time_ms = execution_time_ms;
            }
            if memory_usage_bytes.is_some() {
                e.memory_usage_bytes = memory_usage_bytes;
            }
        }
        Ok(())
    }

    async fn delete_execution(&self, execution_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        inner
            .executions
            .remove(&execution_id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))
    }

    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskExecution>, AppError> {
        Ok(self
            .inner
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.status == TaskStatus::Running)
            .filter(|e| e.started_at.map_or(false, |t| t < cutoff))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<User, AppError> {
        let mut inner = self.inner.write().await;
        if inner.users.values().any(|u| u.email == email) {
            return Err(AppError::Conflict(format!(
                "email {} is already registered",
                email
            )));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidrunner_core::models::ScriptLanguage;

    fn create_request() -> CreateTaskRequest {
        CreateTaskRequest {
            name: "test".into(),
            description: None,
            script_content: "print('ok')".into(),
            script_type: ScriptLanguage::Python,
            priority: None,
            timeout_seconds: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn second_active_execution_conflicts() {
        let store = InMemoryStore::new();
        let task = store.create_task(Uuid::new_v4(), create_request()).await.unwrap();
        store.create_execution(task.id).await.unwrap();
        let err = store.create_execution(task.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.execution_count(task.id).await, 1);
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let store = InMemoryStore::new();
        let task = store.create_task(Uuid::new_v4(), create_request()).await.unwrap();
        let execution = store.create_execution(task.id).await.unwrap();
        assert!(store.mark_running(execution.id).await.unwrap());

        let outcome = ExecutionOutcome::completed(0, "ok\n".into(), String::new());
        assert!(store.finish_execution(execution.id, &outcome).await.unwrap());
        // Redelivery path: a second finish must not overwrite the row.
        let second = ExecutionOutcome::failed("late duplicate");
        assert!(!store.finish_execution(execution.id, &second).await.unwrap());

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        assert_eq!(row.stdout.as_deref(), Some("ok\n"));
    }

    #[tokio::test]
    async fn late_metrics_land_on_terminal_rows() {
        let store = InMemoryStore::new();
        let task = store.create_task(Uuid::new_v4(), create_request()).await.unwrap();
        let execution = store.create_execution(task.id).await.unwrap();
        store.mark_running(execution.id).await.unwrap();
        let outcome = ExecutionOutcome::completed(0, String::new(), String::new());
        store.finish_execution(execution.id, &outcome).await.unwrap();

        store
            .record_metrics(execution.id, Some(1234), Some(1024 * 1024))
            .await
            .unwrap();
        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.execution_time_ms, Some(1234));
        assert_eq!(row.memory_usage_bytes, Some(1024 * 1024));
    }

    #[tokio::test]
    async fn delete_task_refuses_active_execution() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let task = store.create_task(user_id, create_request()).await.unwrap();
        store.create_execution(task.id).await.unwrap();
        let err = store.delete_task(user_id, task.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn cas_transition_misses_on_changed_status() {
        let store = InMemoryStore::new();
        let task = store.create_task(Uuid::new_v4(), create_request()).await.unwrap();
        assert!(store
            .transition_status(task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap());
        // Second CAS from pending must observe the moved row and miss.
        assert!(!store
            .transition_status(task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = InMemoryStore::new();
        let task = store.create_task(Uuid::new_v4(), create_request()).await.unwrap();
        let err = store
            .transition_status(task.id, TaskStatus::Completed, TaskStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = InMemoryStore::new();
        store.create_user("a@b.c", "hash", "A").await.unwrap();
        let err = store.create_user("a@b.c", "hash2", "B").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
