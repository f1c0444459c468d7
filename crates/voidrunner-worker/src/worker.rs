//! One worker: lease a message, run it in the sandbox, persist the
//! outcome, ack or nack, heartbeat throughout.
//!
//! Crash-safe persistence order: execution row first, then the task row
//! (CAS from `running`), then the queue ack. A crash between any of
//! those steps leads to a redelivery that observes the terminal
//! execution row and turns into a no-op ack.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voidrunner_core::error::AppError;
use voidrunner_core::models::{ExecutionOutcome, QueueMessage, Task, TaskExecution, TaskStatus};
use voidrunner_core::repository::{ExecutionRepository, TaskRepository};
use voidrunner_executor::Executor;
use voidrunner_queue::retry::fail_exhausted_task;
use voidrunner_queue::{NackOutcome, QueueError, TaskQueue};

use crate::limits::ConcurrencyLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Leasing,
    Running,
    Persisting,
    Draining,
    Stopped,
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Leasing => write!(f, "leasing"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Persisting => write!(f, "persisting"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Everything a worker needs, shared across the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn TaskQueue>,
    pub tasks: Arc<dyn TaskRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub executor: Arc<dyn Executor>,
    pub limits: Arc<ConcurrencyLimits>,
    /// Visibility lease per delivery; must exceed the longest execution.
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    /// Idle wait between lease attempts when primary is empty.
    pub poll_interval: Duration,
}

pub struct Worker {
    id: String,
    ctx: WorkerContext,
    state: Arc<Mutex<WorkerState>>,
    drain: CancellationToken,
    force_cancel: CancellationToken,
}

impl Worker {
    pub fn new(id: String, ctx: WorkerContext) -> Self {
        Self {
            id,
            ctx,
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            drain: CancellationToken::new(),
            force_cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state_handle(&self) -> Arc<Mutex<WorkerState>> {
        Arc::clone(&self.state)
    }

    /// Stops new leases; the in-flight message still runs to terminal.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Cancels the in-flight execution (forced shutdown path).
    pub fn force_cancel_token(&self) -> CancellationToken {
        self.force_cancel.clone()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("worker state poisoned") = state;
    }

    pub async fn run(self) {
        tracing::info!(worker_id = %self.id, "Worker started");
        loop {
            if self.drain.is_cancelled() {
                self.set_state(WorkerState::Draining);
                break;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    self.set_state(WorkerState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                        _ = self.drain.cancelled() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Worker iteration failed");
                    self.set_state(WorkerState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                        _ = self.drain.cancelled() => {}
                    }
                }
            }
        }
        self.set_state(WorkerState::Stopped);
        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    /// One loop iteration: lease and fully handle a single message.
    /// Returns whether a message was available.
    pub async fn process_next(&self) -> Result<bool, AppError> {
        self.set_state(WorkerState::Leasing);
        let msg = match self.ctx.queue.lease(&self.id, self.ctx.lease).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.process_message(&msg).await {
            tracing::error!(
                worker_id = %self.id,
                task_id = %msg.task_id,
                error = %e,
                "Message processing failed, returning delivery"
            );
            self.nack_transient(&msg, &e.to_string()).await;
        }
        Ok(true)
    }

    #[tracing::instrument(skip(self, msg), fields(worker_id = %self.id, task_id = %msg.task_id, attempts = msg.attempts))]
    async fn process_message(&self, msg: &QueueMessage) -> Result<(), AppError> {
        let task_id = msg.task_id;

        let Some(task) = self.ctx.tasks.get_task(task_id).await? else {
            tracing::warn!("Leased message for unknown task, dropping");
            self.ack(task_id).await;
            return Ok(());
        };
        let Some(execution) = self.ctx.executions.latest_execution(task_id).await? else {
            tracing::warn!("Leased message without an execution row, dropping");
            self.ack(task_id).await;
            return Ok(());
        };
        if execution.is_terminal() {
            // Redelivery after a crash between persistence and ack, or a
            // cancelled-before-lease message: the verdict already stands.
            tracing::info!(execution_id = %execution.id, status = %execution.status, "Execution already terminal, no-op ack");
            self.ack(task_id).await;
            return Ok(());
        }

        let Some(_permit) = self
            .ctx
            .limits
            .try_acquire(task.user_id, task.script_type)
        else {
            tracing::debug!(user_id = %task.user_id, "Concurrency cap reached, returning message");
            self.nack_transient(msg, "concurrency cap reached").await;
            return Ok(());
        };

        self.set_state(WorkerState::Running);
        self.run_and_persist(&task, &execution, msg).await
    }

    async fn run_and_persist(
        &self,
        task: &Task,
        execution: &TaskExecution,
        msg: &QueueMessage,
    ) -> Result<(), AppError> {
        // `false` here means a redelivered attempt already moved the row
        // out of pending; the run proceeds either way.
        self.ctx.executions.mark_running(execution.id).await?;
        self.ctx
            .tasks
            .transition_status(task.id, TaskStatus::Pending, TaskStatus::Running)
            .await?;

        let exec_cancel = self.force_cancel.child_token();
        let heartbeat = self.spawn_heartbeat(task.id, execution.id, exec_cancel.clone());

        let result = self.ctx.executor.execute(task, exec_cancel).await;
        let lease_lost = heartbeat.stop().await;

        self.set_state(WorkerState::Persisting);
        if lease_lost {
            // The broker stopped answering heartbeats: the lease is (or
            // will be) reclaimed and the delivery redelivered. Nothing
            // is persisted, the execution row stays active for the next
            // attempt.
            tracing::warn!(task_id = %task.id, "Execution aborted after lost lease");
            return Ok(());
        }
        match result {
            Ok(outcome) => self.persist_outcome(task, execution, outcome).await,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "Sandbox run failed, scheduling retry");
                self.nack_or_dead_letter(msg, &e.to_string()).await
            }
            Err(e) => {
                // Structural failure (e.g. unmapped language): terminal on
                // the first attempt, no retry.
                tracing::error!(error = %e, "Sandbox rejected task, failing execution");
                let outcome = ExecutionOutcome::failed(e.to_string());
                self.persist_outcome(task, execution, outcome).await
            }
        }
    }

    /// Execution row -> task row -> ack, in that order.
    async fn persist_outcome(
        &self,
        task: &Task,
        execution: &TaskExecution,
        outcome: ExecutionOutcome,
    ) -> Result<(), AppError> {
        let finished = self
            .ctx
            .executions
            .finish_execution(execution.id, &outcome)
            .await?;

        if finished {
            let moved = self
                .ctx
                .tasks
                .transition_status(task.id, TaskStatus::Running, outcome.status)
                .await?;
            if !moved && TaskStatus::Pending.can_transition_to(outcome.status) {
                self.ctx
                    .tasks
                    .transition_status(task.id, TaskStatus::Pending, outcome.status)
                    .await?;
            }
        } else {
            // The row went terminal elsewhere (user cancel, stale reap);
            // its verdict stands, only late metrics may land.
            self.ctx
                .executions
                .record_metrics(
                    execution.id,
                    Some(outcome.execution_time_ms),
                    outcome.memory_usage_bytes,
                )
                .await?;
        }

        self.ack(task.id).await;
        Ok(())
    }

    async fn nack_or_dead_letter(&self, msg: &QueueMessage, reason: &str) -> Result<(), AppError> {
        match self.ctx.queue.nack(&self.id, msg, reason).await {
            Ok(NackOutcome::Retried { visible_at }) => {
                tracing::info!(task_id = %msg.task_id, visible_at = %visible_at, "Delivery scheduled for retry");
                Ok(())
            }
            Ok(NackOutcome::DeadLettered) => {
                tracing::warn!(task_id = %msg.task_id, "Delivery exhausted, recording failure");
                fail_exhausted_task(
                    self.ctx.tasks.as_ref(),
                    self.ctx.executions.as_ref(),
                    msg.task_id,
                )
                .await
                .map_err(AppError::from)
            }
            Err(QueueError::LeaseExpired(_)) => {
                tracing::warn!(task_id = %msg.task_id, "Lease expired before nack; sweep owns the delivery");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort nack for transient conditions; errors only logged,
    /// lease expiry covers the rest.
    async fn nack_transient(&self, msg: &QueueMessage, reason: &str) {
        if let Err(e) = self.nack_or_dead_letter(msg, reason).await {
            tracing::error!(task_id = %msg.task_id, error = %e, "Nack failed; delivery will be reclaimed by sweep");
        }
    }

    /// Best-effort ack; a lost ack only costs one redelivered no-op.
    async fn ack(&self, task_id: Uuid) {
        match self.ctx.queue.ack(&self.id, task_id).await {
            Ok(()) => {}
            Err(QueueError::LeaseExpired(_)) => {
                tracing::warn!(task_id = %task_id, "Ack raced lease expiry");
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Ack failed");
            }
        }
    }

    /// Refreshes the visibility lease every interval and propagates
    /// user-requested cancellation (observed as a terminal `cancelled`
    /// execution row) into the execution's cancellation token. A failed
    /// heartbeat also aborts the execution: without a lease the delivery
    /// will be redelivered anyway, so the container must not keep
    /// running. The guard reports which of the two happened.
    fn spawn_heartbeat(
        &self,
        task_id: Uuid,
        execution_id: Uuid,
        exec_cancel: CancellationToken,
    ) -> HeartbeatGuard {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lease_lost);
        let queue = Arc::clone(&self.ctx.queue);
        let executions = Arc::clone(&self.ctx.executions);
        let worker_id = self.id.clone();
        let interval = self.ctx.heartbeat_interval;
        let lease = self.ctx.lease;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.cancelled() => break,
                }

                if let Err(e) = queue.extend_lease(&worker_id, task_id, lease).await {
                    tracing::warn!(
                        worker_id = %worker_id,
                        task_id = %task_id,
                        error = %e,
                        "Heartbeat failed, aborting execution"
                    );
                    lost_flag.store(true, Ordering::SeqCst);
                    exec_cancel.cancel();
                    break;
                }

                match executions.get_execution(execution_id).await {
                    Ok(Some(row)) if row.status == TaskStatus::Cancelled => {
                        tracing::info!(task_id = %task_id, "Cancellation observed on heartbeat");
                        exec_cancel.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Database hiccups do not abort a healthy run.
                        tracing::warn!(error = %e, "Heartbeat cancellation check failed");
                    }
                }
            }
        });

        HeartbeatGuard {
            stop,
            handle,
            lease_lost,
        }
    }
}

struct HeartbeatGuard {
    stop: CancellationToken,
    handle: JoinHandle<()>,
    lease_lost: Arc<AtomicBool>,
}

impl HeartbeatGuard {
    /// Stops the heartbeat; returns whether the lease was lost.
    async fn stop(self) -> bool {
        self.stop.cancel();
        let _ = self.handle.await;
        self.lease_lost.load(Ordering::SeqCst)
    }
}
