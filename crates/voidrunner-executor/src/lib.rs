//! VoidRunner sandbox executor
//!
//! One container per execution: read-only rootfs, no network, dropped
//! capabilities, seccomp, cgroup limits. `DockerExecutor` drives a real
//! Docker daemon; `MockExecutor` is a deterministic drop-in used by
//! tests and as a startup fallback when the daemon is unreachable.

pub mod docker;
pub mod mock;
pub mod security;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use voidrunner_core::models::{ExecutionOutcome, ScriptLanguage, Task};

/// Sandbox failures that never produced a terminal outcome.
///
/// `Runtime` failures are transient from the pipeline's point of view:
/// the worker nacks and the message retries. `InvalidLanguage` is
/// structural and fails the execution on the first attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no sandbox image configured for language {0}")]
    InvalidLanguage(ScriptLanguage),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl ExecutorError {
    /// Whether a retry of the same execution can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExecutorError::InvalidLanguage(_) => false,
            ExecutorError::Runtime(_) => true,
        }
    }
}

/// The executor capability set: run one task, probe the runtime, sweep
/// dangling sandboxes. Implementations are selected once at startup.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the task's script to a terminal outcome, honoring the task
    /// timeout and the caller's cancellation token. Errors mean the
    /// sandbox never reached a verdict; the delivery should be retried.
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError>;

    /// Probes the container runtime daemon.
    async fn is_healthy(&self) -> bool;

    /// Removes dangling sandbox containers owned by this deployment
    /// (matched by label). Returns how many were removed.
    async fn cleanup(&self) -> Result<usize, ExecutorError>;
}

/// Script filename inside the sandbox for each language.
pub(crate) fn script_filename(language: ScriptLanguage) -> &'static str {
    match language {
        ScriptLanguage::Python => "script.py",
        ScriptLanguage::Javascript => "script.js",
        ScriptLanguage::Bash => "script.sh",
        ScriptLanguage::Go => "script.go",
    }
}

/// Interpreter invocation for the script at `path`.
pub(crate) fn interpreter_command(language: ScriptLanguage, path: &str) -> Vec<String> {
    match language {
        ScriptLanguage::Python => vec!["python3".into(), path.into()],
        ScriptLanguage::Javascript => vec!["node".into(), path.into()],
        ScriptLanguage::Bash => vec!["bash".into(), path.into()],
        ScriptLanguage::Go => vec!["go".into(), "run".into(), path.into()],
    }
}

pub(crate) const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Appends `chunk` to `buf` up to `cap` bytes of payload, marking the
/// buffer once on overflow. Returns whether the buffer is (now) full.
pub(crate) fn push_bounded(buf: &mut String, chunk: &str, cap: usize) -> bool {
    if buf.len() >= cap {
        return true;
    }
    let room = cap - buf.len();
    if chunk.len() <= room {
        buf.push_str(chunk);
        buf.len() >= cap
    } else {
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.push_str(&chunk[..cut]);
        buf.push_str(TRUNCATION_MARKER);
        true
    }
}

/// Effective wall-clock budget: the task's own timeout bounded above by
/// the deployment ceiling.
pub(crate) fn effective_timeout(task_timeout_seconds: i32, max_timeout: Duration) -> Duration {
    Duration::from_secs(task_timeout_seconds.max(1) as u64).min(max_timeout)
}

pub use docker::DockerExecutor;
pub use mock::MockExecutor;
pub use security::SeccompProfileManager;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_commands_cover_all_languages() {
        assert_eq!(
            interpreter_command(ScriptLanguage::Python, "/sandbox/script.py"),
            vec!["python3", "/sandbox/script.py"]
        );
        assert_eq!(
            interpreter_command(ScriptLanguage::Go, "/sandbox/script.go"),
            vec!["go", "run", "/sandbox/script.go"]
        );
    }

    #[test]
    fn bounded_push_truncates_once() {
        let mut buf = String::new();
        assert!(!push_bounded(&mut buf, "hello ", 10));
        assert!(push_bounded(&mut buf, "world and more", 10));
        assert_eq!(buf, format!("hello worl{}", TRUNCATION_MARKER));
        // Further pushes are dropped.
        assert!(push_bounded(&mut buf, "extra", 10));
        assert_eq!(buf, format!("hello worl{}", TRUNCATION_MARKER));
    }

    #[test]
    fn bounded_push_respects_char_boundaries() {
        let mut buf = String::new();
        push_bounded(&mut buf, "αβγδε", 5);
        assert!(buf.starts_with("αβ"));
        assert!(buf.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn effective_timeout_is_capped() {
        let cap = Duration::from_secs(3600);
        assert_eq!(effective_timeout(5, cap), Duration::from_secs(5));
        assert_eq!(effective_timeout(7200, cap), cap);
        assert_eq!(effective_timeout(0, cap), Duration::from_secs(1));
    }
}
