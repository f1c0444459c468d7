//! Docker-backed sandbox executor.
//!
//! Per execution: write the script to a private host dir, create a
//! hardened container (read-only rootfs, `--network=none`, cap-drop ALL,
//! no-new-privileges, non-root user, seccomp, pids/memory/cpu caps,
//! scratch tmpfs), run the language interpreter on the script, enforce
//! the timeout with SIGTERM then SIGKILL after a short grace, capture
//! bounded output and peak memory, and always remove the container.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voidrunner_core::config::ExecutorConfig;
use voidrunner_core::models::{ExecutionOutcome, Task, TaskStatus};

use crate::{
    effective_timeout, interpreter_command, push_bounded, script_filename, Executor, ExecutorError,
};

const SANDBOX_DIR: &str = "/sandbox";
const TASK_LABEL: &str = "voidrunner.task_id";
/// Seconds between SIGTERM and SIGKILL on timeout or cancellation.
const STOP_GRACE_SECS: i64 = 2;
const SCRATCH_TMPFS_BYTES: u64 = 64 * 1024 * 1024;

fn runtime_err(context: &str, e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Runtime(format!("{}: {}", context, e))
}

enum Verdict {
    Exited(i64),
    TimedOut,
    Cancelled,
}

pub struct DockerExecutor {
    docker: Docker,
    config: ExecutorConfig,
    seccomp_json: Option<String>,
}

impl DockerExecutor {
    /// Connects to the local daemon. `seccomp_json` is the rendered
    /// profile from the security manager; `None` disables seccomp.
    pub fn new(config: ExecutorConfig, seccomp_json: Option<String>) -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| runtime_err("failed to connect to Docker", e))?;
        Ok(Self {
            docker,
            config,
            seccomp_json,
        })
    }

    fn security_opt(&self) -> Vec<String> {
        build_security_opt(
            self.seccomp_json.as_deref(),
            self.config.apparmor_profile.as_deref(),
        )
    }

    async fn create_sandbox(
        &self,
        task: &Task,
        image: &str,
        script_dir: &Path,
    ) -> Result<String, ExecutorError> {
        let script_path = format!("{}/{}", SANDBOX_DIR, script_filename(task.script_type));
        let host_config = sandbox_host_config(&self.config, script_dir, self.security_opt());

        let labels: HashMap<String, String> =
            [(TASK_LABEL.to_string(), task.id.to_string())].into();
        let container_config = ContainerConfig {
            image: Some(image.to_string()),
            cmd: Some(interpreter_command(task.script_type, &script_path)),
            working_dir: Some(SANDBOX_DIR.to_string()),
            env: Some(vec![
                "HOME=/tmp".to_string(),
                "TMPDIR=/tmp".to_string(),
                "GOCACHE=/tmp/gocache".to_string(),
            ]),
            user: Some(format!(
                "{}:{}",
                self.config.sandbox_uid, self.config.sandbox_gid
            )),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        // Container names are unique per execution to avoid collisions
        // with remnants of crashed runs.
        let name = format!("voidrunner-{}", Uuid::new_v4());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions::<String> {
                    name,
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(|e| runtime_err("failed to create container", e))?;
        Ok(created.id)
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<i64, ExecutorError> {
        let mut stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Nonzero exits can surface as a wait error depending on the
            // daemon; the reported code is still authoritative.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => {
                tracing::warn!(error = %e, container_id, "wait_container failed, inspecting");
                self.inspect_exit_code(container_id).await
            }
            None => Err(ExecutorError::Runtime(
                "container wait stream ended unexpectedly".into(),
            )),
        }
    }

    async fn inspect_exit_code(&self, container_id: &str) -> Result<i64, ExecutorError> {
        let inspected = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| runtime_err("failed to inspect container", e))?;
        inspected
            .state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| ExecutorError::Runtime("container has no exit code".into()))
    }

    /// SIGTERM, wait out the grace, SIGKILL. Docker's stop endpoint does
    /// exactly this given a timeout.
    async fn stop_sandbox(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions { t: STOP_GRACE_SECS }),
            )
            .await
        {
            tracing::warn!(error = %e, container_id, "Failed to stop container");
        }
    }

    async fn collect_output(&self, container_id: &str) -> (String, String) {
        let cap = self.config.max_output_bytes;
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stdout_full = false;
        let mut stderr_full = false;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) if !stdout_full => {
                    stdout_full = push_bounded(&mut stdout, &String::from_utf8_lossy(&message), cap);
                }
                Ok(LogOutput::StdErr { message }) if !stderr_full => {
                    stderr_full = push_bounded(&mut stderr, &String::from_utf8_lossy(&message), cap);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, container_id, "Error reading container logs");
                    break;
                }
            }
            if stdout_full && stderr_full {
                break;
            }
        }
        (stdout, stderr)
    }

    /// Peak cgroup memory, sampled before removal. Best-effort: cgroup
    /// v2 daemons may not expose `max_usage`, in which case the final
    /// usage sample stands in.
    async fn sample_peak_memory(&self, container_id: &str) -> Option<i64> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => stats
                .memory_stats
                .max_usage
                .or(stats.memory_stats.usage)
                .map(|v| v as i64),
            Some(Err(e)) => {
                tracing::debug!(error = %e, container_id, "Failed to sample memory stats");
                None
            }
            None => None,
        }
    }

    async fn remove_sandbox(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::warn!(error = %e, container_id, "Failed to remove container");
        }
    }

    async fn run_sandbox(
        &self,
        container_id: &str,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let timeout = effective_timeout(
            task.timeout_seconds,
            Duration::from_secs(self.config.max_timeout_secs),
        );

        let started = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| runtime_err("failed to start container", e))?;

        let verdict = tokio::select! {
            exit = self.wait_for_exit(container_id) => Verdict::Exited(exit?),
            _ = tokio::time::sleep(timeout) => Verdict::TimedOut,
            _ = cancel.cancelled() => Verdict::Cancelled,
        };

        let return_code = match &verdict {
            Verdict::Exited(code) => *code,
            Verdict::TimedOut | Verdict::Cancelled => {
                self.stop_sandbox(container_id).await;
                self.inspect_exit_code(container_id).await.unwrap_or(137)
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let (stdout, stderr) = self.collect_output(container_id).await;
        let memory_peak = self.sample_peak_memory(container_id).await;

        let mut outcome = match verdict {
            Verdict::Exited(code) => ExecutionOutcome::completed(code as i32, stdout, stderr),
            Verdict::TimedOut => ExecutionOutcome {
                status: TaskStatus::Timeout,
                return_code: Some(return_code as i32),
                stdout,
                stderr,
                execution_time_ms: 0,
                memory_usage_bytes: None,
            },
            Verdict::Cancelled => ExecutionOutcome {
                status: TaskStatus::Cancelled,
                return_code: Some(return_code as i32),
                stdout,
                stderr,
                execution_time_ms: 0,
                memory_usage_bytes: None,
            },
        };
        outcome.execution_time_ms = duration_ms;
        outcome.memory_usage_bytes = memory_peak;
        Ok(outcome)
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    #[tracing::instrument(skip(self, task, cancel), fields(task_id = %task.id, language = %task.script_type))]
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let image = self
            .config
            .images
            .get(&task.script_type)
            .cloned()
            .ok_or(ExecutorError::InvalidLanguage(task.script_type))?;

        // The script lives in a per-execution host dir, bind-mounted
        // read-only; the tempdir is dropped (and deleted) after the run.
        let script_dir = tempfile::tempdir()
            .map_err(|e| runtime_err("failed to create script dir", e))?;
        let script_path = script_dir.path().join(script_filename(task.script_type));
        fs::write(&script_path, &task.script_content)
            .map_err(|e| runtime_err("failed to write script", e))?;
        // The sandbox user is unprivileged; the script must be world-readable.
        fs::set_permissions(script_dir.path(), fs::Permissions::from_mode(0o755))
            .and_then(|_| fs::set_permissions(&script_path, fs::Permissions::from_mode(0o644)))
            .map_err(|e| runtime_err("failed to set script permissions", e))?;

        let container_id = self.create_sandbox(task, &image, script_dir.path()).await?;
        tracing::debug!(container_id = %container_id, image = %image, "Sandbox created");

        let result = self.run_sandbox(&container_id, task, cancel).await;
        self.remove_sandbox(&container_id).await;

        match &result {
            Ok(outcome) => tracing::info!(
                status = %outcome.status,
                return_code = ?outcome.return_code,
                duration_ms = outcome.execution_time_ms,
                "Sandbox run finished"
            ),
            Err(e) => tracing::error!(error = %e, "Sandbox run failed"),
        }
        result
    }

    async fn is_healthy(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    #[tracing::instrument(skip(self))]
    async fn cleanup(&self) -> Result<usize, ExecutorError> {
        let filters: HashMap<String, Vec<String>> =
            [("label".to_string(), vec![TASK_LABEL.to_string()])].into();
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| runtime_err("failed to list containers", e))?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            self.remove_sandbox(&id).await;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up dangling sandbox containers");
        }
        Ok(removed)
    }
}

fn build_security_opt(seccomp_json: Option<&str>, apparmor: Option<&str>) -> Vec<String> {
    let mut opts = vec!["no-new-privileges:true".to_string()];
    if let Some(json) = seccomp_json {
        opts.push(format!("seccomp={}", json));
    }
    if let Some(profile) = apparmor {
        opts.push(format!("apparmor={}", profile));
    }
    opts
}

fn sandbox_host_config(
    config: &ExecutorConfig,
    script_dir: &Path,
    security_opt: Vec<String>,
) -> HostConfig {
    HostConfig {
        binds: Some(vec![format!(
            "{}:{}:ro",
            script_dir.display(),
            SANDBOX_DIR
        )]),
        tmpfs: Some(
            [(
                "/tmp".to_string(),
                format!("rw,size={}", SCRATCH_TMPFS_BYTES),
            )]
            .into(),
        ),
        readonly_rootfs: Some(true),
        network_mode: Some("none".to_string()),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(security_opt),
        pids_limit: Some(config.pids_limit),
        memory: Some(config.memory_limit_bytes),
        memory_swap: Some(config.memory_limit_bytes),
        cpu_period: Some(config.cpu_period_micros),
        cpu_quota: Some(config.cpu_quota_micros),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidrunner_core::models::ScriptLanguage;

    fn executor_config() -> ExecutorConfig {
        let mut images = HashMap::new();
        for lang in ScriptLanguage::ALL {
            images.insert(lang, format!("test-{}:latest", lang));
        }
        ExecutorConfig {
            images,
            sandbox_uid: 65534,
            sandbox_gid: 65534,
            memory_limit_bytes: 256 * 1024 * 1024,
            cpu_period_micros: 100_000,
            cpu_quota_micros: 50_000,
            pids_limit: 128,
            max_timeout_secs: 3600,
            max_output_bytes: 1024 * 1024,
            seccomp_enabled: true,
            seccomp_profile_path: "/tmp/seccomp.json".into(),
            apparmor_profile: None,
            fallback_to_mock: true,
        }
    }

    #[test]
    fn security_opt_always_blocks_privilege_escalation() {
        let opts = build_security_opt(None, None);
        assert_eq!(opts, vec!["no-new-privileges:true".to_string()]);

        let opts = build_security_opt(Some("{\"defaultAction\":\"SCMP_ACT_ERRNO\"}"), Some("vr"));
        assert!(opts[0] == "no-new-privileges:true");
        assert!(opts[1].starts_with("seccomp={"));
        assert_eq!(opts[2], "apparmor=vr");
    }

    #[test]
    fn host_config_is_hardened() {
        let config = executor_config();
        let host = sandbox_host_config(&config, Path::new("/tmp/scripts"), vec![]);

        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        // No swap headroom beyond the memory cap.
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(
            host.binds,
            Some(vec!["/tmp/scripts:/sandbox:ro".to_string()])
        );
        assert!(host.tmpfs.unwrap().contains_key("/tmp"));
    }
}
