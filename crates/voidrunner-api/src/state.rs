//! Shared application state handed to every handler.

use std::sync::Arc;

use sqlx::PgPool;

use voidrunner_core::repository::{ExecutionRepository, TaskRepository, UserRepository};
use voidrunner_core::Config;
use voidrunner_executor::Executor;
use voidrunner_queue::TaskQueue;
use voidrunner_worker::WorkerManager;

use crate::auth::{AuthFailureLimiter, JwtService};
use crate::services::ExecutionService;

pub struct AppState {
    pub config: Config,
    pub users: Arc<dyn UserRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub executor: Arc<dyn Executor>,
    pub execution_service: ExecutionService,
    pub jwt: JwtService,
    pub auth_limiter: AuthFailureLimiter,
    /// Present in the full service; `None` under tests without Postgres.
    pub db_pool: Option<PgPool>,
    /// Present in the full service; `None` when the pool runs elsewhere.
    pub worker_manager: Option<Arc<WorkerManager>>,
}
