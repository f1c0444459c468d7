//! In-memory queue with the same semantics as the Redis broker:
//! depth cap, duplicate rejection, visibility leases, backoff on nack,
//! dead-lettering on exhaustion and sweep-based lease reclamation.
//!
//! Backs tests and brokerless local development.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use voidrunner_core::config::QueueConfig;
use voidrunner_core::models::QueueMessage;

use crate::backoff::{retry_delay, retry_delay_deterministic};
use crate::queue::{
    primary_score, NackOutcome, QueueDepths, QueueError, SweepReport, TaskQueue,
};

/// Which subqueue currently holds a message. Test-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Primary,
    Retry,
    Inflight,
    Dead,
}

#[derive(Default)]
struct State {
    /// Envelopes for everything in primary/retry/inflight.
    msgs: HashMap<Uuid, QueueMessage>,
    primary: HashSet<Uuid>,
    /// task_id -> visible_at epoch ms.
    retry: HashMap<Uuid, i64>,
    /// worker_id -> task_id -> lease deadline epoch ms.
    inflight: HashMap<String, HashMap<Uuid, i64>>,
    dead: Vec<QueueMessage>,
}

pub struct InMemoryQueue {
    state: Mutex<State>,
    depth_cap: usize,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl InMemoryQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            depth_cap: config.depth_cap,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// Where the message currently lives, if anywhere.
    pub fn locate(&self, task_id: Uuid) -> Option<Location> {
        let state = self.state.lock().expect("queue state poisoned");
        if state.primary.contains(&task_id) {
            return Some(Location::Primary);
        }
        if state.retry.contains_key(&task_id) {
            return Some(Location::Retry);
        }
        if state
            .inflight
            .values()
            .any(|held| held.contains_key(&task_id))
        {
            return Some(Location::Inflight);
        }
        if state.dead.iter().any(|m| m.task_id == task_id) {
            return Some(Location::Dead);
        }
        None
    }

    /// Makes pending retry entries due immediately, so tests can drive a
    /// sweep without waiting out the backoff.
    pub fn expire_retry_delays(&self) {
        let mut state = self.state.lock().expect("queue state poisoned");
        let now = Utc::now().timestamp_millis();
        for visible in state.retry.values_mut() {
            *visible = now - 1;
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, msg: QueueMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.primary.len() >= self.depth_cap {
            return Err(QueueError::QueueFull);
        }
        let live = state.primary.contains(&msg.task_id)
            || state.retry.contains_key(&msg.task_id)
            || state
                .inflight
                .values()
                .any(|held| held.contains_key(&msg.task_id));
        if live {
            return Err(QueueError::Duplicate(msg.task_id));
        }
        state.primary.insert(msg.task_id);
        state.msgs.insert(msg.task_id, msg);
        Ok(())
    }

    async fn lease(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let best = state
            .primary
            .iter()
            .filter_map(|id| state.msgs.get(id))
            .min_by_key(|m| (primary_score(m.priority, m.enqueued_at), m.task_id))
            .cloned();

        let Some(msg) = best else {
            return Ok(None);
        };
        state.primary.remove(&msg.task_id);
        let expires = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        state
            .inflight
            .entry(worker_id.to_string())
            .or_default()
            .insert(msg.task_id, expires);
        Ok(Some(msg))
    }

    async fn ack(&self, worker_id: &str, task_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let held = state
            .inflight
            .get_mut(worker_id)
            .and_then(|held| held.remove(&task_id));
        if held.is_none() {
            return Err(QueueError::LeaseExpired(task_id));
        }
        state.msgs.remove(&task_id);
        Ok(())
    }

    async fn nack(
        &self,
        worker_id: &str,
        msg: &QueueMessage,
        _reason: &str,
    ) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let held = state
            .inflight
            .get_mut(worker_id)
            .and_then(|held| held.remove(&msg.task_id));
        if held.is_none() {
            return Err(QueueError::LeaseExpired(msg.task_id));
        }

        let mut updated = msg.clone();
        updated.attempts = msg.attempts + 1;
        if updated.attempts >= updated.max_attempts {
            state.msgs.remove(&msg.task_id);
            state.dead.push(updated);
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = retry_delay(updated.attempts, self.backoff_base, self.backoff_max);
        updated.visible_at =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let visible_ms = updated.visible_at.timestamp_millis();
        state.retry.insert(updated.task_id, visible_ms);
        state.msgs.insert(updated.task_id, updated.clone());
        Ok(NackOutcome::Retried {
            visible_at: updated.visible_at,
        })
    }

    async fn extend_lease(
        &self,
        worker_id: &str,
        task_id: Uuid,
        lease: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let entry = state
            .inflight
            .get_mut(worker_id)
            .and_then(|held| held.get_mut(&task_id));
        match entry {
            Some(expires) => {
                *expires = Utc::now().timestamp_millis() + lease.as_millis() as i64;
                Ok(())
            }
            None => Err(QueueError::LeaseExpired(task_id)),
        }
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let removed = state.primary.remove(&task_id) || state.retry.remove(&task_id).is_some();
        if removed {
            state.msgs.remove(&task_id);
        }
        Ok(removed)
    }

    async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let now = Utc::now().timestamp_millis();
        let mut report = SweepReport::default();

        let due: Vec<Uuid> = state
            .retry
            .iter()
            .filter(|(_, visible)| **visible <= now)
            .map(|(id, _)| *id)
            .collect();
        for task_id in due {
            state.retry.remove(&task_id);
            state.primary.insert(task_id);
            report.promoted += 1;
        }

        let workers: Vec<String> = state.inflight.keys().cloned().collect();
        for worker in workers {
            let expired: Vec<Uuid> = state
                .inflight
                .get(&worker)
                .map(|held| {
                    held.iter()
                        .filter(|(_, expires)| **expires < now)
                        .map(|(id, _)| *id)
                        .collect()
                })
                .unwrap_or_default();
            for task_id in expired {
                if let Some(held) = state.inflight.get_mut(&worker) {
                    held.remove(&task_id);
                }
                let Some(msg) = state.msgs.get(&task_id).cloned() else {
                    continue;
                };
                let mut updated = msg;
                updated.attempts += 1;
                if updated.attempts >= updated.max_attempts {
                    state.msgs.remove(&task_id);
                    state.dead.push(updated);
                    report.dead_lettered.push(task_id);
                } else {
                    let delay = retry_delay_deterministic(
                        updated.attempts,
                        self.backoff_base,
                        self.backoff_max,
                    );
                    let visible_ms = now + delay.as_millis() as i64;
                    updated.visible_at = Utc
                        .timestamp_millis_opt(visible_ms)
                        .single()
                        .unwrap_or_else(Utc::now);
                    state.retry.insert(task_id, visible_ms);
                    state.msgs.insert(task_id, updated);
                    report.reclaimed += 1;
                }
            }
            if state
                .inflight
                .get(&worker)
                .map(|held| held.is_empty())
                .unwrap_or(false)
            {
                state.inflight.remove(&worker);
            }
        }

        Ok(report)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let state = self.state.lock().expect("queue state poisoned");
        let skip = state.dead.len().saturating_sub(limit);
        Ok(state.dead.iter().skip(skip).cloned().collect())
    }

    async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let state = self.state.lock().expect("queue state poisoned");
        Ok(QueueDepths {
            primary: state.primary.len() as u64,
            retry: state.retry.len() as u64,
            dead: state.dead.len() as u64,
            inflight: state.inflight.values().map(|held| held.len() as u64).sum(),
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn queue_config(depth_cap: usize) -> QueueConfig {
        QueueConfig {
            redis_url: "redis://unused".into(),
            depth_cap,
            lease_seconds: 60,
            heartbeat_interval_secs: 10,
            sweep_interval_secs: 1,
            backoff_base_secs: 10,
            backoff_max_secs: 600,
            max_attempts: 3,
        }
    }

    fn message(priority: i32) -> QueueMessage {
        QueueMessage::new(Uuid::new_v4(), priority, 3)
    }

    #[tokio::test]
    async fn lease_pops_highest_priority_first() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let low = message(2);
        let high = message(9);
        queue.enqueue(low.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();

        let first = queue.lease("w-1", LEASE).await.unwrap().unwrap();
        assert_eq!(first.task_id, high.task_id);
        let second = queue.lease("w-1", LEASE).await.unwrap().unwrap();
        assert_eq!(second.task_id, low.task_id);
        assert!(queue.lease("w-1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_at_depth_cap() {
        let queue = InMemoryQueue::new(&queue_config(2));
        queue.enqueue(message(5)).await.unwrap();
        queue.enqueue(message(5)).await.unwrap();
        let err = queue.enqueue(message(5)).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull));
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicates_anywhere_live() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let msg = message(5);
        queue.enqueue(msg.clone()).await.unwrap();
        assert!(matches!(
            queue.enqueue(msg.clone()).await.unwrap_err(),
            QueueError::Duplicate(_)
        ));

        // Still a duplicate while leased.
        let leased = queue.lease("w-1", LEASE).await.unwrap().unwrap();
        assert!(matches!(
            queue.enqueue(leased.clone()).await.unwrap_err(),
            QueueError::Duplicate(_)
        ));

        // Gone after ack; re-enqueue is fine.
        queue.ack("w-1", leased.task_id).await.unwrap();
        queue.enqueue(leased).await.unwrap();
    }

    #[tokio::test]
    async fn ack_of_unleased_message_is_lease_expired() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let err = queue.ack("w-1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseExpired(_)));
    }

    #[tokio::test]
    async fn nack_parks_on_retry_until_exhaustion() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let msg = message(5);
        let task_id = msg.task_id;
        queue.enqueue(msg).await.unwrap();

        // Attempt 1 and 2 go to retry, attempt 3 dead-letters.
        for expected_attempts in 1..=2 {
            let leased = queue.lease("w-1", LEASE).await.unwrap().unwrap();
            assert_eq!(leased.attempts, expected_attempts - 1);
            let outcome = queue.nack("w-1", &leased, "boom").await.unwrap();
            assert!(matches!(outcome, NackOutcome::Retried { .. }));
            assert_eq!(queue.locate(task_id), Some(Location::Retry));
            queue.expire_retry_delays();
            queue.sweep().await.unwrap();
            assert_eq!(queue.locate(task_id), Some(Location::Primary));
        }

        let leased = queue.lease("w-1", LEASE).await.unwrap().unwrap();
        assert_eq!(leased.attempts, 2);
        let outcome = queue.nack("w-1", &leased, "boom").await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        assert_eq!(queue.locate(task_id), Some(Location::Dead));

        // Exhausted messages never reappear in primary.
        queue.expire_retry_delays();
        queue.sweep().await.unwrap();
        assert_eq!(queue.locate(task_id), Some(Location::Dead));
        assert!(queue.lease("w-1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_leases() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let msg = message(5);
        let task_id = msg.task_id;
        queue.enqueue(msg).await.unwrap();

        // Zero-length lease simulates a crashed worker.
        queue.lease("w-dead", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(queue.locate(task_id), Some(Location::Inflight));

        let report = queue.sweep().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(queue.locate(task_id), Some(Location::Retry));
    }

    #[tokio::test]
    async fn reclamation_counts_as_an_attempt_and_exhausts() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let mut msg = message(5);
        msg.max_attempts = 1;
        let task_id = msg.task_id;
        queue.enqueue(msg).await.unwrap();

        queue.lease("w-dead", Duration::ZERO).await.unwrap().unwrap();
        let report = queue.sweep().await.unwrap();
        assert_eq!(report.dead_lettered, vec![task_id]);
        assert_eq!(queue.locate(task_id), Some(Location::Dead));
    }

    #[tokio::test]
    async fn heartbeat_extends_only_live_leases() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let msg = message(5);
        queue.enqueue(msg.clone()).await.unwrap();
        let leased = queue.lease("w-1", LEASE).await.unwrap().unwrap();
        queue
            .extend_lease("w-1", leased.task_id, LEASE)
            .await
            .unwrap();

        queue.ack("w-1", leased.task_id).await.unwrap();
        let err = queue
            .extend_lease("w-1", leased.task_id, LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseExpired(_)));
    }

    #[tokio::test]
    async fn remove_only_hits_waiting_messages() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let msg = message(5);
        queue.enqueue(msg.clone()).await.unwrap();
        assert!(queue.remove(msg.task_id).await.unwrap());
        assert_eq!(queue.locate(msg.task_id), None);

        // A leased message is out of reach for remove.
        let other = message(5);
        queue.enqueue(other.clone()).await.unwrap();
        queue.lease("w-1", LEASE).await.unwrap().unwrap();
        assert!(!queue.remove(other.task_id).await.unwrap());
        assert_eq!(queue.locate(other.task_id), Some(Location::Inflight));
    }

    #[tokio::test]
    async fn message_is_always_in_exactly_one_place() {
        let queue = InMemoryQueue::new(&queue_config(100));
        let msg = message(7);
        let task_id = msg.task_id;

        queue.enqueue(msg).await.unwrap();
        assert_eq!(queue.locate(task_id), Some(Location::Primary));

        let leased = queue.lease("w-1", LEASE).await.unwrap().unwrap();
        assert_eq!(queue.locate(task_id), Some(Location::Inflight));

        queue.nack("w-1", &leased, "transient").await.unwrap();
        assert_eq!(queue.locate(task_id), Some(Location::Retry));

        queue.expire_retry_delays();
        queue.sweep().await.unwrap();
        assert_eq!(queue.locate(task_id), Some(Location::Primary));

        let leased = queue.lease("w-2", LEASE).await.unwrap().unwrap();
        queue.ack("w-2", leased.task_id).await.unwrap();
        assert_eq!(queue.locate(task_id), None);

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths, QueueDepths::default());
    }
}
