//! Retry processor: periodically sweeps the broker, promoting due
//! retries back to primary and reclaiming leases from crashed workers.
//! Messages that exhaust their attempts during reclamation get their
//! executions failed here, since no worker remains to do it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use voidrunner_core::models::{ExecutionOutcome, TaskStatus};
use voidrunner_core::repository::{ExecutionRepository, TaskRepository};

use crate::queue::TaskQueue;

pub const EXHAUSTED_REASON: &str = "retries exhausted: message moved to dead-letter queue";

pub struct RetryProcessor {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RetryProcessor {
    pub fn spawn(
        queue: Arc<dyn TaskQueue>,
        tasks: Arc<dyn TaskRepository>,
        executions: Arc<dyn ExecutionRepository>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Retry processor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_once(queue.as_ref(), tasks.as_ref(), executions.as_ref()).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::info!("Retry processor stopped");
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    async fn run_once(
        queue: &dyn TaskQueue,
        tasks: &dyn TaskRepository,
        executions: &dyn ExecutionRepository,
    ) {
        let report = match queue.sweep().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Queue sweep failed");
                return;
            }
        };

        if report.promoted > 0 || report.reclaimed > 0 || !report.dead_lettered.is_empty() {
            tracing::info!(
                promoted = report.promoted,
                reclaimed = report.reclaimed,
                dead_lettered = report.dead_lettered.len(),
                "Sweep pass"
            );
        }

        for task_id in report.dead_lettered {
            if let Err(e) = fail_exhausted_task(tasks, executions, task_id).await {
                tracing::error!(
                    error = %e,
                    task_id = %task_id,
                    "Failed to record exhaustion on dead-lettered task"
                );
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

/// Marks the active execution (and its task) of an exhausted message as
/// failed. A no-op when the execution is already terminal.
pub async fn fail_exhausted_task(
    tasks: &dyn TaskRepository,
    executions: &dyn ExecutionRepository,
    task_id: Uuid,
) -> Result<(), anyhow::Error> {
    let Some(execution) = executions.latest_execution(task_id).await? else {
        tracing::warn!(task_id = %task_id, "Dead-lettered task has no execution row");
        return Ok(());
    };
    if execution.is_terminal() {
        return Ok(());
    }

    let outcome = ExecutionOutcome::failed(EXHAUSTED_REASON);
    executions.finish_execution(execution.id, &outcome).await?;

    // The task may still be pending if no worker ever started the attempt.
    let moved = tasks
        .transition_status(task_id, TaskStatus::Running, TaskStatus::Failed)
        .await?
        || tasks
            .transition_status(task_id, TaskStatus::Pending, TaskStatus::Failed)
            .await?;
    if !moved {
        tracing::debug!(task_id = %task_id, "Task already terminal during exhaustion handling");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidrunner_core::config::QueueConfig;
    use voidrunner_core::models::{CreateTaskRequest, QueueMessage, ScriptLanguage};
    use voidrunner_db::InMemoryStore;

    use crate::memory::{InMemoryQueue, Location};

    fn queue_config() -> QueueConfig {
        QueueConfig {
            redis_url: "redis://unused".into(),
            depth_cap: 100,
            lease_seconds: 60,
            heartbeat_interval_secs: 10,
            sweep_interval_secs: 1,
            backoff_base_secs: 1,
            backoff_max_secs: 10,
            max_attempts: 3,
        }
    }

    fn create_request() -> CreateTaskRequest {
        CreateTaskRequest {
            name: "t".into(),
            description: None,
            script_content: "print('x')".into(),
            script_type: ScriptLanguage::Python,
            priority: None,
            timeout_seconds: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn exhausted_reclamation_fails_execution_and_task() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        let store = Arc::new(InMemoryStore::new());

        let task = store
            .create_task(Uuid::new_v4(), create_request())
            .await
            .unwrap();
        let execution = store.create_execution(task.id).await.unwrap();
        store.mark_running(execution.id).await.unwrap();
        store
            .transition_status(task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap();

        let mut msg = QueueMessage::new(task.id, task.priority, 1);
        msg.max_attempts = 1;
        queue.enqueue(msg).await.unwrap();
        // Crash simulation: a lease that is already expired.
        queue
            .lease("w-dead", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let report = queue.sweep().await.unwrap();
        assert_eq!(report.dead_lettered, vec![task.id]);
        for task_id in report.dead_lettered {
            fail_exhausted_task(store.as_ref(), store.as_ref(), task_id)
                .await
                .unwrap();
        }

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.stderr.as_deref(), Some(EXHAUSTED_REASON));
        let task_row = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_row.status, TaskStatus::Failed);
        assert_eq!(queue.locate(task.id), Some(Location::Dead));
    }

    #[tokio::test]
    async fn exhaustion_is_a_no_op_on_terminal_executions() {
        let store = Arc::new(InMemoryStore::new());
        let task = store
            .create_task(Uuid::new_v4(), create_request())
            .await
            .unwrap();
        let execution = store.create_execution(task.id).await.unwrap();
        store.mark_running(execution.id).await.unwrap();
        let outcome = ExecutionOutcome::completed(0, "done".into(), String::new());
        store
            .finish_execution(execution.id, &outcome)
            .await
            .unwrap();

        fail_exhausted_task(store.as_ref(), store.as_ref(), task.id)
            .await
            .unwrap();

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn processor_shutdown_is_prompt() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        let store = Arc::new(InMemoryStore::new());
        let processor =
            RetryProcessor::spawn(queue, store.clone(), store, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        processor.shutdown().await;
    }
}
