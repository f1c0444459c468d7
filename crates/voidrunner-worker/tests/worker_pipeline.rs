//! End-to-end pipeline scenarios against the in-memory store, the
//! in-memory broker and the mock executor: enqueue, lease, execute,
//! persist, ack/nack, retry, dead-letter, cancellation and shutdown.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use voidrunner_core::config::{QueueConfig, WorkerConfig};
use voidrunner_core::models::{
    CreateTaskRequest, ExecutionOutcome, QueueMessage, ScriptLanguage, Task, TaskExecution,
    TaskStatus,
};
use voidrunner_core::repository::{ExecutionRepository, TaskRepository, UserRepository};
use voidrunner_db::InMemoryStore;
use voidrunner_executor::MockExecutor;
use voidrunner_queue::{InMemoryQueue, QueueDepths, TaskQueue};
use voidrunner_worker::{ConcurrencyLimits, Worker, WorkerContext, WorkerManager};

const MAX_ATTEMPTS: i32 = 3;

struct Harness {
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryQueue>,
    executor: Arc<MockExecutor>,
    ctx: WorkerContext,
}

fn harness() -> Harness {
    let queue_config = QueueConfig {
        redis_url: "redis://unused".into(),
        depth_cap: 100,
        lease_seconds: 60,
        heartbeat_interval_secs: 1,
        sweep_interval_secs: 1,
        backoff_base_secs: 1,
        backoff_max_secs: 10,
        max_attempts: MAX_ATTEMPTS,
    };
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new(&queue_config));
    let executor = Arc::new(MockExecutor::new());
    let ctx = WorkerContext {
        queue: queue.clone(),
        tasks: store.clone(),
        executions: store.clone(),
        executor: executor.clone(),
        limits: Arc::new(ConcurrencyLimits::new(4, None)),
        lease: Duration::from_secs(60),
        heartbeat_interval: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
    };
    Harness {
        store,
        queue,
        executor,
        ctx,
    }
}

/// Create the task row, its pending execution and the queue message the
/// way the execution service does.
async fn submit(
    harness: &Harness,
    script: &str,
    language: ScriptLanguage,
    timeout_seconds: i32,
) -> (Task, TaskExecution) {
    let user = harness
        .store
        .create_user(&format!("{}@example.com", Uuid::new_v4()), "hash", "Test")
        .await
        .unwrap();
    let task = harness
        .store
        .create_task(
            user.id,
            CreateTaskRequest {
                name: "scenario".into(),
                description: None,
                script_content: script.into(),
                script_type: language,
                priority: Some(5),
                timeout_seconds: Some(timeout_seconds),
                metadata: None,
            },
        )
        .await
        .unwrap();
    let execution = harness.store.create_execution(task.id).await.unwrap();
    harness
        .queue
        .enqueue(QueueMessage::new(task.id, task.priority, MAX_ATTEMPTS))
        .await
        .unwrap();
    (task, execution)
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn happy_path_runs_to_completed() {
    let h = harness();
    let (task, execution) = submit(&h, "print('ok')", ScriptLanguage::Python, 5).await;

    let worker = Worker::new("voidrunner-test-0".into(), h.ctx.clone());
    assert!(worker.process_next().await.unwrap());

    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert_eq!(row.return_code, Some(0));
    assert_eq!(row.stdout.as_deref(), Some("ok\n"));
    assert!(row.started_at.is_some());
    assert!(row.completed_at.is_some());

    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Completed);
    assert_eq!(h.queue.depths().await.unwrap(), QueueDepths::default());
}

#[tokio::test]
async fn failing_exit_code_marks_failed() {
    let h = harness();
    let (task, execution) = submit(&h, "import sys; sys.exit(2)", ScriptLanguage::Python, 5).await;

    let worker = Worker::new("voidrunner-test-0".into(), h.ctx.clone());
    assert!(worker.process_next().await.unwrap());

    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.return_code, Some(2));
    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Failed);
}

#[tokio::test]
async fn long_script_times_out() {
    let h = harness();
    let (task, execution) =
        submit(&h, "import time; time.sleep(10)", ScriptLanguage::Python, 1).await;

    let worker = Worker::new("voidrunner-test-0".into(), h.ctx.clone());
    assert!(worker.process_next().await.unwrap());

    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Timeout);
    assert_ne!(row.return_code, Some(0));
    // Wall time is at least the timeout but nowhere near the sleep.
    let wall = row.execution_time_ms.unwrap();
    assert!((1000..5000).contains(&wall), "wall time was {}ms", wall);
    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Timeout);
}

#[tokio::test]
async fn user_cancellation_propagates_via_heartbeat() {
    let h = harness();
    let (task, execution) =
        submit(&h, "import time; time.sleep(30)", ScriptLanguage::Python, 60).await;

    let worker = Worker::new("voidrunner-test-0".into(), h.ctx.clone());
    let drain = worker.drain_token();
    let running = tokio::spawn(worker.run());

    // Wait for the attempt to be running.
    wait_until(|| async {
        h.store
            .get_execution(execution.id)
            .await
            .unwrap()
            .map(|row| row.status == TaskStatus::Running)
            .unwrap_or(false)
    })
    .await;

    // The cancel endpoint marks the rows; the worker notices on its next
    // heartbeat tick and kills the sandbox.
    let cancelled = ExecutionOutcome {
        status: TaskStatus::Cancelled,
        return_code: None,
        stdout: String::new(),
        stderr: "cancellation requested".into(),
        execution_time_ms: 0,
        memory_usage_bytes: None,
    };
    assert!(h
        .store
        .finish_execution(execution.id, &cancelled)
        .await
        .unwrap());
    let task_moved = h
        .store
        .transition_status(task.id, TaskStatus::Running, TaskStatus::Cancelled)
        .await
        .unwrap()
        || h.store
            .transition_status(task.id, TaskStatus::Pending, TaskStatus::Cancelled)
            .await
            .unwrap();
    assert!(task_moved);

    wait_until(|| async { h.queue.depths().await.unwrap() == QueueDepths::default() }).await;

    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Cancelled);

    drain.cancel();
    let _ = running.await;
}

#[tokio::test]
async fn transient_failures_retry_then_dead_letter() {
    let h = harness();
    let (task, execution) = submit(&h, "print('never')", ScriptLanguage::Python, 5).await;
    h.executor
        .inject_runtime_failures(task.id, MAX_ATTEMPTS as u32);

    let worker = Worker::new("voidrunner-test-0".into(), h.ctx.clone());
    for attempt in 1..=MAX_ATTEMPTS {
        assert!(worker.process_next().await.unwrap(), "attempt {}", attempt);
        if attempt < MAX_ATTEMPTS {
            // Parked on retry; make it due and promote it.
            assert_eq!(h.queue.depths().await.unwrap().retry, 1);
            h.queue.expire_retry_delays();
            h.queue.sweep().await.unwrap();
            assert_eq!(h.queue.depths().await.unwrap().primary, 1);
        }
    }

    let depths = h.queue.depths().await.unwrap();
    assert_eq!(depths.dead, 1);
    assert_eq!(depths.primary + depths.retry + depths.inflight, 0);

    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert!(row.stderr.unwrap().contains("retries exhausted"));
    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Failed);

    // All three attempts actually reached the executor.
    assert_eq!(h.executor.executed_tasks().len(), MAX_ATTEMPTS as usize);
}

#[tokio::test]
async fn redelivered_terminal_execution_is_a_no_op_ack() {
    let h = harness();
    let (task, execution) = submit(&h, "print('ok')", ScriptLanguage::Python, 5).await;

    // Simulate a crash after persistence but before ack: the rows are
    // terminal while the message is still deliverable.
    let outcome = ExecutionOutcome::completed(0, "ok\n".into(), String::new());
    h.store.mark_running(execution.id).await.unwrap();
    h.store.finish_execution(execution.id, &outcome).await.unwrap();
    h.store
        .transition_status(task.id, TaskStatus::Pending, TaskStatus::Running)
        .await
        .unwrap();
    h.store
        .transition_status(task.id, TaskStatus::Running, TaskStatus::Completed)
        .await
        .unwrap();

    let worker = Worker::new("voidrunner-test-0".into(), h.ctx.clone());
    assert!(worker.process_next().await.unwrap());

    // Nothing executed, message gone, verdict unchanged.
    assert!(h.executor.executed_tasks().is_empty());
    assert_eq!(h.queue.depths().await.unwrap(), QueueDepths::default());
    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
}

#[tokio::test]
async fn per_user_cap_returns_message_without_executing() {
    let h = harness();
    let mut ctx = h.ctx.clone();
    ctx.limits = Arc::new(ConcurrencyLimits::new(1, None));

    let (task, _execution) = submit(&h, "print('ok')", ScriptLanguage::Python, 5).await;
    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();

    // Saturate the user's budget from elsewhere in the pool.
    let _held = ctx
        .limits
        .try_acquire(task_row.user_id, ScriptLanguage::Bash)
        .unwrap();

    let worker = Worker::new("voidrunner-test-0".into(), ctx);
    assert!(worker.process_next().await.unwrap());

    assert!(h.executor.executed_tasks().is_empty());
    // Back on the retry subqueue with one attempt consumed.
    let depths = h.queue.depths().await.unwrap();
    assert_eq!(depths.retry, 1);
    let dead = h.queue.dead_letters(10).await.unwrap();
    assert!(dead.is_empty());
}

#[tokio::test]
async fn manager_shutdown_force_cancels_stuck_executions() {
    let h = harness();
    let (task, execution) =
        submit(&h, "import time; time.sleep(30)", ScriptLanguage::Python, 60).await;

    let config = WorkerConfig {
        worker_prefix: "voidrunner".into(),
        poll_interval_ms: 20,
        initial_pool_size: 2,
        min_pool_size: 1,
        max_pool_size: 4,
        autoscale_enabled: false,
        scaling_check_interval_secs: 3600,
        scale_up_watermark: 50,
        scale_down_watermark: 5,
        per_user_cap: 4,
        per_language_cap: None,
        shutdown_timeout_secs: 1,
        stale_check_interval_secs: 3600,
        stale_threshold_secs: 3900,
    };
    let manager = WorkerManager::new(h.ctx.clone(), config);
    manager.start();
    assert_eq!(manager.pool_size(), 2);

    wait_until(|| async {
        h.store
            .get_execution(execution.id)
            .await
            .unwrap()
            .map(|row| row.status == TaskStatus::Running)
            .unwrap_or(false)
    })
    .await;

    // Drain times out after 1s, then the force-cancel path kills the run.
    manager.shutdown().await;

    let row = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
    let task_row = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Cancelled);
    let status = manager.status().await;
    assert_eq!(status.pool_size, 0);
}

#[tokio::test]
async fn manager_drains_idle_pool_promptly() {
    let h = harness();
    let config = WorkerConfig {
        worker_prefix: "voidrunner".into(),
        poll_interval_ms: 20,
        initial_pool_size: 3,
        min_pool_size: 1,
        max_pool_size: 4,
        autoscale_enabled: false,
        scaling_check_interval_secs: 3600,
        scale_up_watermark: 50,
        scale_down_watermark: 5,
        per_user_cap: 4,
        per_language_cap: None,
        shutdown_timeout_secs: 30,
        stale_check_interval_secs: 3600,
        stale_threshold_secs: 3900,
    };
    let manager = WorkerManager::new(h.ctx.clone(), config);
    manager.start();

    let started = std::time::Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
}
