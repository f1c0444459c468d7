//! VoidRunner API service library
//!
//! The HTTP boundary over the execution pipeline: JWT auth, task and
//! execution endpoints, the execution service bridging the repository
//! and the queue, plus startup wiring for the worker pool, the retry
//! processor and the stale reaper.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod services;
pub mod setup;
pub mod state;
pub mod telemetry;
