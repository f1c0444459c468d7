use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::TaskStatus;

/// One attempt to run a task inside a sandbox.
///
/// Terminal rows are immutable except for late-arriving metrics
/// (`execution_time_ms`, `memory_usage_bytes`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub return_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub memory_usage_bytes: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for TaskExecution {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(TaskExecution {
            id: row.get("id"),
            task_id: row.get("task_id"),
            status: row.get::<String, _>("status").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse execution status: {}", e).into())
            })?,
            return_code: row.get("return_code"),
            stdout: row.get("stdout"),
            stderr: row.get("stderr"),
            execution_time_ms: row.get("execution_time_ms"),
            memory_usage_bytes: row.get("memory_usage_bytes"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            created_at: row.get("created_at"),
        })
    }
}

impl TaskExecution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// What a sandbox run produced; persisted onto the execution row when it
/// reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Terminal status: completed, failed, timeout or cancelled.
    pub status: TaskStatus,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: i64,
    pub memory_usage_bytes: Option<i64>,
}

impl ExecutionOutcome {
    pub fn completed(return_code: i32, stdout: String, stderr: String) -> Self {
        let status = if return_code == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        Self {
            status,
            return_code: Some(return_code),
            stdout,
            stderr,
            execution_time_ms: 0,
            memory_usage_bytes: None,
        }
    }

    /// Terminal failure with a diagnostic in stderr and no exit code,
    /// used when the sandbox never produced one (runtime refusal, stale
    /// reap, retry exhaustion).
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            return_code: None,
            stdout: String::new(),
            stderr: reason.into(),
            execution_time_ms: 0,
            memory_usage_bytes: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub return_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub memory_usage_bytes: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<TaskExecution> for ExecutionResponse {
    fn from(e: TaskExecution) -> Self {
        Self {
            id: e.id,
            task_id: e.task_id,
            status: e.status,
            return_code: e.return_code,
            stdout: e.stdout,
            stderr: e.stderr,
            execution_time_ms: e.execution_time_ms,
            memory_usage_bytes: e.memory_usage_bytes,
            started_at: e.started_at,
            completed_at: e.completed_at,
            created_at: e.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_maps_to_completed() {
        let outcome = ExecutionOutcome::completed(0, "ok\n".into(), String::new());
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.return_code, Some(0));
    }

    #[test]
    fn nonzero_exit_maps_to_failed() {
        let outcome = ExecutionOutcome::completed(2, String::new(), String::new());
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.return_code, Some(2));
    }

    #[test]
    fn failed_outcome_carries_diagnostic() {
        let outcome = ExecutionOutcome::failed("retries exhausted");
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.return_code, None);
        assert_eq!(outcome.stderr, "retries exhausted");
    }

    #[test]
    fn active_covers_pending_and_running() {
        let mut execution = TaskExecution {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
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
        assert!(execution.is_active());
        execution.status = TaskStatus::Running;
        assert!(execution.is_active());
        execution.status = TaskStatus::Completed;
        assert!(!execution.is_active());
        assert!(execution.is_terminal());
    }
}
