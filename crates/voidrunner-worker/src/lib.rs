//! VoidRunner worker pool
//!
//! Workers run lease -> execute -> persist -> ack/nack loops against the
//! queue, with heartbeats refreshing their visibility leases. The
//! manager owns the pool: startup, per-user/per-language admission,
//! optional auto-scaling on queue depth, graceful shutdown and the stale
//! execution reaper.

pub mod limits;
pub mod manager;
pub mod stale;
pub mod worker;

pub use limits::ConcurrencyLimits;
pub use manager::{PoolStatus, WorkerManager};
pub use stale::StaleReaper;
pub use worker::{Worker, WorkerContext, WorkerState};
