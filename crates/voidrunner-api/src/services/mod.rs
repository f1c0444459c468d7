pub mod execution;

pub use execution::{ExecutionService, UpdateExecutionRequest};
