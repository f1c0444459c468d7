//! VoidRunner core library
//!
//! Domain models (tasks, executions, users, queue messages), the unified
//! error taxonomy, environment-driven configuration and the repository
//! contracts implemented by `voidrunner-db`.

pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod validation;

pub use config::Config;
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use repository::{ExecutionRepository, TaskRepository, UserRepository};
