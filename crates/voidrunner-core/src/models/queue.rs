use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker-side envelope for one runnable task. The broker owns these;
/// workers hold them only for the duration of a visibility lease.
/// Timestamps serialize as epoch milliseconds so broker-side scripts can
/// patch envelopes without a date parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessage {
    pub task_id: Uuid,
    /// Delivery attempts consumed so far.
    pub attempts: i32,
    pub max_attempts: i32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant the message may be leased again (retry delay /
    /// visibility timeout).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub visible_at: DateTime<Utc>,
    pub priority: i32,
}

impl QueueMessage {
    pub fn new(task_id: Uuid, priority: i32, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            attempts: 0,
            max_attempts,
            enqueued_at: now,
            visible_at: now,
            priority,
        }
    }

    /// Whether another delivery is permitted after the current one fails.
    pub fn can_retry(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_message_has_no_attempts() {
        let msg = QueueMessage::new(Uuid::new_v4(), 5, 3);
        assert_eq!(msg.attempts, 0);
        assert!(msg.can_retry());
        assert_eq!(msg.visible_at, msg.enqueued_at);
    }

    #[test]
    fn retry_budget_counts_the_next_attempt() {
        let mut msg = QueueMessage::new(Uuid::new_v4(), 5, 3);
        msg.attempts = 1;
        assert!(msg.can_retry());
        msg.attempts = 2;
        assert!(!msg.can_retry());
    }
}
