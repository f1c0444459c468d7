//! Stale execution reaper.
//!
//! An execution stuck in `running` longer than the stale threshold has
//! no live worker behind it (the threshold sits above the execution
//! timeout ceiling, so no healthy run can legitimately last that long).
//! Such rows are failed with a diagnostic reason; their queue messages,
//! if any survive, resolve as no-op acks on redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voidrunner_core::models::{ExecutionOutcome, TaskStatus};
use voidrunner_core::repository::{ExecutionRepository, TaskRepository};

pub const STALE_REASON: &str = "stale: no worker heartbeat observed within the stale threshold";

pub struct StaleReaper {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StaleReaper {
    pub fn spawn(
        tasks: Arc<dyn TaskRepository>,
        executions: Arc<dyn ExecutionRepository>,
        interval: Duration,
        threshold_secs: i64,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs(),
                threshold_secs,
                "Stale reaper started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_once(tasks.as_ref(), executions.as_ref(), threshold_secs).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::info!("Stale reaper stopped");
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

pub async fn run_once(
    tasks: &dyn TaskRepository,
    executions: &dyn ExecutionRepository,
    threshold_secs: i64,
) {
    let cutoff = Utc::now() - chrono::Duration::seconds(threshold_secs);
    let stale = match executions.find_stale_running(cutoff).await {
        Ok(stale) => stale,
        Err(e) => {
            tracing::error!(error = %e, "Stale scan failed");
            return;
        }
    };

    for execution in stale {
        tracing::warn!(
            execution_id = %execution.id,
            task_id = %execution.task_id,
            started_at = ?execution.started_at,
            "Reaping stale execution"
        );
        let outcome = ExecutionOutcome::failed(STALE_REASON);
        match executions.finish_execution(execution.id, &outcome).await {
            Ok(true) => {
                if let Err(e) = tasks
                    .transition_status(execution.task_id, TaskStatus::Running, TaskStatus::Failed)
                    .await
                {
                    tracing::error!(error = %e, task_id = %execution.task_id, "Failed to fail stale task");
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, execution_id = %execution.id, "Failed to reap stale execution");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use voidrunner_core::models::{CreateTaskRequest, ScriptLanguage};
    use voidrunner_db::InMemoryStore;

    #[tokio::test]
    async fn reaps_only_old_running_executions() {
        let store = Arc::new(InMemoryStore::new());
        let task = store
            .create_task(
                Uuid::new_v4(),
                CreateTaskRequest {
                    name: "t".into(),
                    description: None,
                    script_content: "print('x')".into(),
                    script_type: ScriptLanguage::Python,
                    priority: None,
                    timeout_seconds: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        store
            .transition_status(task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap();
        let execution = store.create_execution(task.id).await.unwrap();
        store.mark_running(execution.id).await.unwrap();

        // Fresh running execution survives a reap with a generous threshold.
        run_once(store.as_ref(), store.as_ref(), 3600).await;
        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);

        // With a negative threshold the cutoff is in the future and the
        // same row counts as stale.
        run_once(store.as_ref(), store.as_ref(), -1).await;
        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.stderr.as_deref(), Some(STALE_REASON));
        let task_row = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_row.status, TaskStatus::Failed);
    }
}
