pub mod routes;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use voidrunner_core::repository::{ExecutionRepository, TaskRepository, UserRepository};
use voidrunner_core::Config;
use voidrunner_db::{PgExecutionRepository, PgTaskRepository, PgUserRepository};
use voidrunner_executor::{DockerExecutor, Executor, MockExecutor, SeccompProfileManager};
use voidrunner_queue::{RedisTaskQueue, RetryProcessor, TaskQueue};
use voidrunner_worker::{ConcurrencyLimits, StaleReaper, WorkerContext, WorkerManager};

use crate::auth::{AuthFailureLimiter, JwtService};
use crate::services::ExecutionService;
use crate::state::AppState;

/// Everything the binary owns besides the HTTP server; shut down in
/// order after the server stops accepting requests.
pub struct Background {
    pub worker_manager: Arc<WorkerManager>,
    pub retry_processor: RetryProcessor,
    pub stale_reaper: StaleReaper,
}

impl Background {
    pub async fn shutdown(self) {
        self.worker_manager.shutdown().await;
        self.retry_processor.shutdown().await;
        self.stale_reaper.shutdown().await;
    }
}

/// Wires the database, broker, executor, worker pool and HTTP state.
pub async fn initialize_app(config: Config) -> Result<(Arc<AppState>, Background)> {
    let pool = voidrunner_db::connect(&config.database).await?;
    voidrunner_db::run_migrations(&pool).await?;

    let users: Arc<dyn UserRepository> = Arc::new(PgUserRepository::new(pool.clone()));
    let tasks: Arc<dyn TaskRepository> = Arc::new(PgTaskRepository::new(pool.clone()));
    let executions: Arc<dyn ExecutionRepository> =
        Arc::new(PgExecutionRepository::new(pool.clone()));

    let queue: Arc<dyn TaskQueue> = Arc::new(
        RedisTaskQueue::new(config.queue.clone())
            .map_err(|e| anyhow::anyhow!("failed to build queue: {}", e))?,
    );
    queue
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("broker unreachable at startup: {}", e))?;

    let executor = select_executor(&config).await?;

    let limits = Arc::new(ConcurrencyLimits::new(
        config.worker.per_user_cap,
        config.worker.per_language_cap,
    ));
    let ctx = WorkerContext {
        queue: Arc::clone(&queue),
        tasks: Arc::clone(&tasks),
        executions: Arc::clone(&executions),
        executor: Arc::clone(&executor),
        limits,
        lease: Duration::from_secs(config.queue.lease_seconds),
        heartbeat_interval: Duration::from_secs(config.queue.heartbeat_interval_secs),
        poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
    };
    let worker_manager = WorkerManager::new(ctx, config.worker.clone());
    worker_manager.start();

    let retry_processor = RetryProcessor::spawn(
        Arc::clone(&queue),
        Arc::clone(&tasks),
        Arc::clone(&executions),
        Duration::from_secs(config.queue.sweep_interval_secs),
    );
    let stale_reaper = StaleReaper::spawn(
        Arc::clone(&tasks),
        Arc::clone(&executions),
        Duration::from_secs(config.worker.stale_check_interval_secs),
        config.worker.stale_threshold_secs,
    );

    let execution_service = ExecutionService::new(
        Arc::clone(&tasks),
        Arc::clone(&executions),
        Arc::clone(&queue),
        config.queue.max_attempts,
    );
    let jwt = JwtService::new(&config.auth.jwt_secret, config.auth.jwt_expiry_hours);
    let auth_limiter = AuthFailureLimiter::new(
        config.auth.auth_failure_max,
        config.auth.auth_failure_window_secs,
    );

    let state = Arc::new(AppState {
        config,
        users,
        tasks,
        executions,
        queue,
        executor,
        execution_service,
        jwt,
        auth_limiter,
        db_pool: Some(pool),
        worker_manager: Some(Arc::clone(&worker_manager)),
    });

    Ok((
        state,
        Background {
            worker_manager,
            retry_processor,
            stale_reaper,
        },
    ))
}

/// Docker when the daemon answers, otherwise the deterministic mock
/// (when the fallback toggle permits). Selected once; dangling sandbox
/// containers from a previous run are swept here.
async fn select_executor(config: &Config) -> Result<Arc<dyn Executor>> {
    let seccomp_json = if config.executor.seccomp_enabled {
        let manager = SeccompProfileManager::install(&config.executor.seccomp_profile_path)
            .context("failed to install seccomp profile")?;
        Some(manager.json().to_string())
    } else {
        tracing::warn!("Seccomp disabled by configuration");
        None
    };

    let docker = match DockerExecutor::new(config.executor.clone(), seccomp_json) {
        Ok(executor) => {
            if executor.is_healthy().await {
                Some(executor)
            } else {
                tracing::warn!("Docker daemon did not answer ping");
                None
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Docker executor unavailable");
            None
        }
    };

    match docker {
        Some(executor) => {
            match executor.cleanup().await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!(removed, "Removed dangling sandbox containers from a previous run")
                }
                Err(e) => tracing::warn!(error = %e, "Startup container sweep failed"),
            }
            tracing::info!("Using Docker sandbox executor");
            Ok(Arc::new(executor))
        }
        None if config.executor.fallback_to_mock => {
            tracing::warn!("Container runtime unavailable, falling back to the mock executor");
            Ok(Arc::new(MockExecutor::new()))
        }
        None => anyhow::bail!("container runtime unavailable and mock fallback is disabled"),
    }
}
