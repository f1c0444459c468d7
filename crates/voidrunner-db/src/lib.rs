//! VoidRunner persistence layer
//!
//! Postgres implementations of the repository contracts from
//! `voidrunner-core`, plus an in-memory store used by tests and local
//! development without a database.

pub mod db;
pub mod memory;

pub use db::execution::PgExecutionRepository;
pub use db::task::PgTaskRepository;
pub use db::user::PgUserRepository;
pub use db::{connect, run_migrations};
pub use memory::InMemoryStore;
