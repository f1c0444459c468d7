//! Pool lifecycle: spawn the initial workers, optionally auto-scale on
//! primary queue depth, aggregate health, and shut down gracefully
//! (drain, bounded wait, force-cancel stragglers).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voidrunner_core::config::WorkerConfig;

use crate::worker::{Worker, WorkerContext, WorkerState};

struct WorkerHandle {
    id: String,
    state: Arc<Mutex<WorkerState>>,
    drain: CancellationToken,
    force_cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub running: usize,
    pub workers: Vec<WorkerStatus>,
    pub queue_primary: u64,
    pub queue_retry: u64,
    pub queue_dead: u64,
    pub queue_inflight: u64,
}

pub struct WorkerManager {
    ctx: WorkerContext,
    config: WorkerConfig,
    instance: String,
    next_seq: AtomicUsize,
    workers: Mutex<Vec<WorkerHandle>>,
    scaler: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WorkerManager {
    pub fn new(ctx: WorkerContext, config: WorkerConfig) -> Arc<Self> {
        let instance = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "local".to_string());
        Arc::new(Self {
            ctx,
            config,
            instance,
            next_seq: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            scaler: Mutex::new(None),
        })
    }

    /// Spawns the initial pool and, if enabled, the auto-scaling loop.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.config.initial_pool_size {
            self.spawn_worker();
        }
        tracing::info!(
            pool_size = self.config.initial_pool_size,
            autoscale = self.config.autoscale_enabled,
            "Worker pool started"
        );

        if self.config.autoscale_enabled {
            let manager = Arc::clone(self);
            let token = CancellationToken::new();
            let stop = token.clone();
            let interval = Duration::from_secs(self.config.scaling_check_interval_secs);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.scaling_tick().await,
                        _ = stop.cancelled() => break,
                    }
                }
            });
            *self.scaler.lock().expect("scaler lock poisoned") = Some((token, handle));
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}-{}", self.config.worker_prefix, self.instance, seq);
        let worker = Worker::new(id.clone(), self.ctx.clone());

        let handle = WorkerHandle {
            id: id.clone(),
            state: worker.state_handle(),
            drain: worker.drain_token(),
            force_cancel: worker.force_cancel_token(),
            join: tokio::spawn(worker.run()),
        };
        self.workers
            .lock()
            .expect("worker registry poisoned")
            .push(handle);
        tracing::info!(worker_id = %id, "Worker spawned");
    }

    async fn scaling_tick(self: &Arc<Self>) {
        let depths = match self.ctx.queue.depths().await {
            Ok(depths) => depths,
            Err(e) => {
                tracing::warn!(error = %e, "Scaling check could not read queue depths");
                return;
            }
        };

        let (count, idle_drained) = {
            let mut workers = self.workers.lock().expect("worker registry poisoned");
            workers.retain(|w| !w.join.is_finished());
            let count = workers.len();
            let backlog = depths.primary as usize;

            if backlog < self.config.scale_down_watermark && count > self.config.min_pool_size {
                let idle = workers.iter().find(|w| {
                    *w.state.lock().expect("worker state poisoned") == WorkerState::Idle
                        && !w.drain.is_cancelled()
                });
                if let Some(worker) = idle {
                    tracing::info!(worker_id = %worker.id, backlog, "Retiring idle worker");
                    worker.drain.cancel();
                    (count, true)
                } else {
                    (count, false)
                }
            } else {
                (count, false)
            }
        };

        if !idle_drained
            && depths.primary as usize > self.config.scale_up_watermark
            && count < self.config.max_pool_size
        {
            tracing::info!(backlog = depths.primary, pool = count, "Scaling up worker pool");
            self.spawn_worker();
        }
    }

    /// Current pool size (live workers).
    pub fn pool_size(&self) -> usize {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        workers.retain(|w| !w.join.is_finished());
        workers.len()
    }

    pub async fn status(&self) -> PoolStatus {
        let depths = self.ctx.queue.depths().await.unwrap_or_default();
        let workers = self.workers.lock().expect("worker registry poisoned");
        let statuses: Vec<WorkerStatus> = workers
            .iter()
            .map(|w| WorkerStatus {
                id: w.id.clone(),
                state: w
                    .state
                    .lock()
                    .expect("worker state poisoned")
                    .to_string(),
            })
            .collect();
        let running = statuses.iter().filter(|s| s.state == "running").count();
        PoolStatus {
            pool_size: statuses.len(),
            running,
            workers: statuses,
            queue_primary: depths.primary,
            queue_retry: depths.retry,
            queue_dead: depths.dead,
            queue_inflight: depths.inflight,
        }
    }

    /// Drain everything, wait up to `shutdown_timeout`, then
    /// force-cancel whatever is still in flight.
    pub async fn shutdown(&self) {
        tracing::info!("Worker pool shutting down");
        if let Some((token, handle)) = self.scaler.lock().expect("scaler lock poisoned").take() {
            token.cancel();
            let _ = handle.await;
        }

        let workers: Vec<WorkerHandle> = {
            let mut lock = self.workers.lock().expect("worker registry poisoned");
            std::mem::take(&mut *lock)
        };
        for worker in &workers {
            worker.drain.cancel();
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        for worker in workers {
            let WorkerHandle {
                id,
                force_cancel,
                mut join,
                ..
            } = worker;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut join).await.is_err() {
                tracing::warn!(worker_id = %id, "Drain timed out, force-cancelling execution");
                force_cancel.cancel();
                // Bounded grace for the SIGTERM/SIGKILL path to finish.
                if tokio::time::timeout(Duration::from_secs(5), &mut join)
                    .await
                    .is_err()
                {
                    tracing::error!(worker_id = %id, "Worker did not stop, aborting");
                    join.abort();
                }
            }
        }
        tracing::info!("Worker pool stopped");
    }
}
