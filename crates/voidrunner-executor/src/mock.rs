//! Deterministic mock executor.
//!
//! Drop-in replacement for the Docker executor when the container
//! runtime is unavailable (and for tests). Outcomes are derived from the
//! script text itself, so the same task always behaves the same way:
//! recognized `exit` calls set the return code, recognized `sleep` calls
//! consume real time and trip the timeout, and simple `print`-style
//! statements produce stdout. Runtime failures can be injected per task
//! to exercise the retry pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voidrunner_core::models::{ExecutionOutcome, ScriptLanguage, Task, TaskStatus};

use crate::{effective_timeout, Executor, ExecutorError};

/// Exit code reported for runs killed by timeout or cancellation,
/// matching a SIGKILL'd container.
const KILLED_EXIT_CODE: i32 = 137;

pub struct MockExecutor {
    healthy: AtomicBool,
    max_timeout: Duration,
    /// task_id -> remaining injected runtime failures.
    injected_failures: Mutex<HashMap<Uuid, u32>>,
    executed: Mutex<Vec<Uuid>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            max_timeout: Duration::from_secs(3600),
            injected_failures: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// The next `count` executions of this task fail with a runtime
    /// error instead of producing an outcome.
    pub fn inject_runtime_failures(&self, task_id: Uuid, count: u32) {
        self.injected_failures
            .lock()
            .expect("mock state poisoned")
            .insert(task_id, count);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Task ids that reached the execute step, in order.
    pub fn executed_tasks(&self) -> Vec<Uuid> {
        self.executed.lock().expect("mock state poisoned").clone()
    }

    fn take_injected_failure(&self, task_id: Uuid) -> bool {
        let mut failures = self.injected_failures.lock().expect("mock state poisoned");
        match failures.get_mut(&task_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    #[tracing::instrument(skip(self, task, cancel), fields(task_id = %task.id))]
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.executed
            .lock()
            .expect("mock state poisoned")
            .push(task.id);

        if self.take_injected_failure(task.id) {
            return Err(ExecutorError::Runtime(
                "injected runtime failure".to_string(),
            ));
        }

        let timeout = effective_timeout(task.timeout_seconds, self.max_timeout);
        let started = Instant::now();

        if let Some(sleep_secs) = parse_sleep_seconds(&task.script_content) {
            let wanted = Duration::from_secs(sleep_secs);
            let naps = wanted.min(timeout);
            let timed_out = wanted >= timeout;
            tokio::select! {
                _ = tokio::time::sleep(naps) => {
                    if timed_out {
                        return Ok(ExecutionOutcome {
                            status: TaskStatus::Timeout,
                            return_code: Some(KILLED_EXIT_CODE),
                            stdout: String::new(),
                            stderr: format!("killed after {} seconds", timeout.as_secs()),
                            execution_time_ms: started.elapsed().as_millis() as i64,
                            memory_usage_bytes: Some(1024 * 1024),
                        });
                    }
                }
                _ = cancel.cancelled() => {
                    return Ok(ExecutionOutcome {
                        status: TaskStatus::Cancelled,
                        return_code: Some(KILLED_EXIT_CODE),
                        stdout: String::new(),
                        stderr: "cancelled".to_string(),
                        execution_time_ms: started.elapsed().as_millis() as i64,
                        memory_usage_bytes: Some(1024 * 1024),
                    });
                }
            }
        }

        let return_code = parse_exit_code(&task.script_content, task.script_type);
        let stdout = parse_stdout(&task.script_content, task.script_type);
        let mut outcome = ExecutionOutcome::completed(return_code, stdout, String::new());
        outcome.execution_time_ms = started.elapsed().as_millis().max(1) as i64;
        outcome.memory_usage_bytes = Some(1024 * 1024);
        Ok(outcome)
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn cleanup(&self) -> Result<usize, ExecutorError> {
        Ok(0)
    }
}

fn digits_at<'a>(s: &'a str, from: usize) -> Option<&'a str> {
    let rest = &s[from..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn parse_after(script: &str, needle: &str) -> Option<i64> {
    let at = script.find(needle)? + needle.len();
    digits_at(script, at)?.parse().ok()
}

/// Exit code from recognized exit idioms; 0 otherwise.
fn parse_exit_code(script: &str, language: ScriptLanguage) -> i32 {
    let from_call = parse_after(script, "sys.exit(")
        .or_else(|| parse_after(script, "process.exit("))
        .or_else(|| parse_after(script, "os.Exit("));
    if let Some(code) = from_call {
        return code as i32;
    }
    if language == ScriptLanguage::Bash {
        for line in script.lines() {
            if let Some(rest) = line.trim().strip_prefix("exit ") {
                if let Ok(code) = rest.trim().parse::<i32>() {
                    return code;
                }
            }
        }
    }
    0
}

/// Seconds slept by recognized sleep idioms.
fn parse_sleep_seconds(script: &str) -> Option<u64> {
    parse_after(script, "time.sleep(")
        .or_else(|| parse_after(script, "sleep("))
        .or_else(|| {
            script.lines().find_map(|line| {
                line.trim()
                    .strip_prefix("sleep ")
                    .and_then(|rest| rest.trim().parse::<i64>().ok())
            })
        })
        .map(|secs| secs.max(0) as u64)
}

fn quoted_arg(line: &str, call: &str) -> Option<String> {
    let at = line.find(call)? + call.len();
    let rest = &line[at..];
    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

/// Stdout produced by simple print idioms, one line each.
fn parse_stdout(script: &str, language: ScriptLanguage) -> String {
    let mut out = String::new();
    for line in script.lines() {
        let printed = match language {
            ScriptLanguage::Python => quoted_arg(line, "print("),
            ScriptLanguage::Javascript => quoted_arg(line, "console.log("),
            ScriptLanguage::Go => quoted_arg(line, "fmt.Println("),
            ScriptLanguage::Bash => line
                .trim()
                .strip_prefix("echo ")
                .map(|rest| rest.trim().trim_matches(|c| c == '\'' || c == '"').to_string()),
        };
        if let Some(text) = printed {
            out.push_str(&text);
            out.push('\n');
        }
    }
    out
}
