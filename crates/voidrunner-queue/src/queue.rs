use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use voidrunner_core::error::AppError;
use voidrunner_core::models::QueueMessage;

/// Broker-level failures. Workers translate `Backend` into a nack;
/// everything else is a definite answer from the broker.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Primary depth cap reached; enqueue rejected.
    #[error("queue is full")]
    QueueFull,

    /// The task already has a message in the queue system.
    #[error("task {0} is already enqueued")]
    Duplicate(Uuid),

    /// The caller's lease no longer exists (expired and reclaimed, or
    /// never held).
    #[error("lease expired for task {0}")]
    LeaseExpired(Uuid),

    #[error("malformed queue payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Broker unreachable or a command failed.
    #[error("broker error: {0}")]
    Backend(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull => AppError::ResourceExhausted("task queue is full".into()),
            QueueError::Duplicate(task_id) => {
                AppError::Conflict(format!("task {} is already enqueued", task_id))
            }
            QueueError::LeaseExpired(task_id) => {
                AppError::Conflict(format!("lease expired for task {}", task_id))
            }
            QueueError::Payload(e) => AppError::Internal(format!("malformed queue payload: {}", e)),
            QueueError::Backend(msg) => AppError::TransientInfrastructure(msg),
        }
    }
}

/// Where a nacked message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Parked on the retry subqueue until `visible_at`.
    Retried { visible_at: DateTime<Utc> },
    /// Retries exhausted; parked on the dead-letter subqueue.
    DeadLettered,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Due retry entries promoted back to primary.
    pub promoted: u64,
    /// Expired leases nacked back onto retry on behalf of their workers.
    pub reclaimed: u64,
    /// Tasks whose reclaimed message exhausted its attempts; their
    /// executions still need to be failed by the caller.
    pub dead_lettered: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub primary: u64,
    pub retry: u64,
    pub dead: u64,
    pub inflight: u64,
}

/// The queue contract. `RedisTaskQueue` is the production broker;
/// `InMemoryQueue` backs tests and brokerless development.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Appends to primary. Fails with `QueueFull` at the depth cap and
    /// `Duplicate` when the task already has a live message.
    async fn enqueue(&self, msg: QueueMessage) -> Result<(), QueueError>;

    /// Atomically pops the best primary entry and records an in-flight
    /// lease for `worker_id`. `None` when primary is empty.
    async fn lease(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<QueueMessage>, QueueError>;

    /// Drops the in-flight entry after terminal persistence.
    async fn ack(&self, worker_id: &str, task_id: Uuid) -> Result<(), QueueError>;

    /// Returns a failed delivery to retry (with backoff) or dead-letter
    /// (when attempts are exhausted).
    async fn nack(
        &self,
        worker_id: &str,
        msg: &QueueMessage,
        reason: &str,
    ) -> Result<NackOutcome, QueueError>;

    /// Heartbeat: pushes the lease deadline out. Fails with
    /// `LeaseExpired` when the entry is gone.
    async fn extend_lease(
        &self,
        worker_id: &str,
        task_id: Uuid,
        lease: Duration,
    ) -> Result<(), QueueError>;

    /// Best-effort removal of a not-yet-leased message (cancellation of
    /// a pending execution). `false` when the message was not waiting.
    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError>;

    /// Promotes due retries and reclaims expired leases.
    async fn sweep(&self) -> Result<SweepReport, QueueError>;

    /// Dead-letter inspection, newest last.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueMessage>, QueueError>;

    async fn depths(&self) -> Result<QueueDepths, QueueError>;

    /// Broker liveness probe.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Primary ordering score: priority descending, then enqueue time
/// ascending. Smaller scores pop first.
pub(crate) fn primary_score(priority: i32, enqueued_at: DateTime<Utc>) -> i64 {
    let priority_band = (10 - priority.clamp(1, 10)) as i64;
    priority_band * 10_000_000_000_000 + enqueued_at.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_scores_lower() {
        let now = Utc::now();
        assert!(primary_score(10, now) < primary_score(9, now));
        assert!(primary_score(5, now) < primary_score(1, now));
    }

    #[test]
    fn earlier_enqueue_wins_within_priority() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(5);
        assert!(primary_score(5, now) < primary_score(5, later));
    }

    #[test]
    fn priority_dominates_enqueue_time() {
        let now = Utc::now();
        let much_later = now + chrono::Duration::days(30);
        assert!(primary_score(6, much_later) < primary_score(5, now));
    }
}
