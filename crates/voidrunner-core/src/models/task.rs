use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Languages a task script can be written in. Each maps to a sandbox
/// image and interpreter in the executor's image map.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Python,
    Javascript,
    Bash,
    Go,
}

impl ScriptLanguage {
    pub const ALL: [ScriptLanguage; 4] = [
        ScriptLanguage::Python,
        ScriptLanguage::Javascript,
        ScriptLanguage::Bash,
        ScriptLanguage::Go,
    ];
}

impl Display for ScriptLanguage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ScriptLanguage::Python => write!(f, "python"),
            ScriptLanguage::Javascript => write!(f, "javascript"),
            ScriptLanguage::Bash => write!(f, "bash"),
            ScriptLanguage::Go => write!(f, "go"),
        }
    }
}

impl FromStr for ScriptLanguage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(ScriptLanguage::Python),
            "javascript" => Ok(ScriptLanguage::Javascript),
            "bash" => Ok(ScriptLanguage::Bash),
            "go" => Ok(ScriptLanguage::Go),
            _ => Err(anyhow::anyhow!("Invalid script language: {}", s)),
        }
    }
}

/// Lifecycle status shared by tasks and executions.
///
/// `pending -> running -> {completed | failed | timeout | cancelled}`,
/// with `cancelled` reachable from `pending` as well, and `failed`
/// reachable from `pending` when a message exhausts its retries before a
/// worker ever ran it. All states on the right-hand side are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine admits `self -> next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Running | TaskStatus::Cancelled | TaskStatus::Failed
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Timeout
                    | TaskStatus::Cancelled
            ),
            _ => false,
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// A user-submitted unit of code plus scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub script_content: String,
    pub script_type: ScriptLanguage,
    pub status: TaskStatus,
    pub priority: i32,
    pub timeout_seconds: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            description: row.get("description"),
            script_content: row.get("script_content"),
            script_type: row.get::<String, _>("script_type").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse script_type: {}", e).into())
            })?,
            status: row.get::<String, _>("status").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse task status: {}", e).into())
            })?,
            priority: row.get("priority"),
            timeout_seconds: row.get("timeout_seconds"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Request body for `POST /api/v1/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub description: Option<String>,
    pub script_content: String,
    pub script_type: ScriptLanguage,
    pub priority: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

/// Request body for `PUT /api/v1/tasks/{id}`. Only mutable fields;
/// script and language are fixed once created.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub script_type: Option<ScriptLanguage>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            status: None,
            script_type: None,
            limit: Some(50),
            offset: Some(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub script_content: String,
    pub script_type: ScriptLanguage,
    pub status: TaskStatus,
    pub priority: i32,
    pub timeout_seconds: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            name: task.name,
            description: task.description,
            script_content: task.script_content,
            script_type: task.script_type,
            status: task.status,
            priority: task.priority,
            timeout_seconds: task.timeout_seconds,
            metadata: task.metadata,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_language_round_trips() {
        for lang in ScriptLanguage::ALL {
            assert_eq!(lang.to_string().parse::<ScriptLanguage>().unwrap(), lang);
        }
        assert!("rust".parse::<ScriptLanguage>().is_err());
    }

    #[test]
    fn status_display_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<TaskStatus>().unwrap(), s);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn pending_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Timeout));
    }

    #[test]
    fn running_transitions() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Timeout));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Timeout,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
