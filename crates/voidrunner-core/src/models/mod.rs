pub mod execution;
pub mod queue;
pub mod task;
pub mod user;

pub use execution::{ExecutionOutcome, ExecutionResponse, TaskExecution};
pub use queue::QueueMessage;
pub use task::{
    CreateTaskRequest, ScriptLanguage, Task, TaskListQuery, TaskResponse, TaskStatus,
    UpdateTaskRequest,
};
pub use user::{User, UserResponse};
