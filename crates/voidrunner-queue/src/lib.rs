//! VoidRunner queue layer
//!
//! Three logical subqueues on one broker: primary (ready to run, ordered
//! by priority then enqueue time), retry (delayed by backoff), and
//! dead-letter (terminal, inspectable). Workers hold messages through
//! visibility leases; every multi-step broker operation runs as one
//! atomic script so a message is always in exactly one place.

pub mod backoff;
pub mod memory;
pub mod queue;
pub mod redis;
pub mod retry;

pub use self::backoff::retry_delay;
pub use self::memory::InMemoryQueue;
pub use self::queue::{NackOutcome, QueueDepths, QueueError, SweepReport, TaskQueue};
pub use self::redis::RedisTaskQueue;
pub use self::retry::RetryProcessor;
