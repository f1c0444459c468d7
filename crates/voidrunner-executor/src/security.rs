//! Seccomp profile synthesis.
//!
//! Default-deny profile with an allowlist sufficient for interpreter
//! startup, I/O on the sandbox mounts, memory management, clocks and
//! process exit. Written once at startup with mode 0600 via an atomic
//! tempfile-then-rename; the Docker executor embeds the JSON into the
//! container's `security_opt`.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Syscalls the sandbox may issue. Everything else returns EPERM.
///
/// Grouped by concern: process/thread bookkeeping, file I/O on the
/// mounted script dir and tmpfs, memory, signals, polling, clocks,
/// identity reads and exit.
const ALLOWED_SYSCALLS: &[&str] = &[
    // process + threads
    "arch_prctl",
    "clone",
    "clone3",
    "execve",
    "exit",
    "exit_group",
    "futex",
    "get_robust_list",
    "gettid",
    "kill",
    "membarrier",
    "prctl",
    "prlimit64",
    "rseq",
    "sched_getaffinity",
    "sched_yield",
    "set_robust_list",
    "set_tid_address",
    "tgkill",
    "vfork",
    "wait4",
    "waitid",
    // file I/O
    "access",
    "chdir",
    "close",
    "close_range",
    "dup",
    "dup2",
    "dup3",
    "faccessat",
    "faccessat2",
    "fchdir",
    "fchmod",
    "fcntl",
    "flock",
    "fstat",
    "fstatfs",
    "fsync",
    "ftruncate",
    "getcwd",
    "getdents64",
    "ioctl",
    "lseek",
    "lstat",
    "mkdir",
    "mkdirat",
    "newfstatat",
    "open",
    "openat",
    "pipe",
    "pipe2",
    "pread64",
    "pwrite64",
    "read",
    "readlink",
    "readlinkat",
    "readv",
    "rename",
    "renameat",
    "rmdir",
    "stat",
    "statfs",
    "statx",
    "umask",
    "unlink",
    "unlinkat",
    "utimensat",
    "write",
    "writev",
    // memory
    "brk",
    "madvise",
    "mmap",
    "mprotect",
    "mremap",
    "munmap",
    // signals
    "rt_sigaction",
    "rt_sigpending",
    "rt_sigprocmask",
    "rt_sigreturn",
    "rt_sigsuspend",
    "rt_sigtimedwait",
    "sigaltstack",
    // polling + events
    "epoll_create1",
    "epoll_ctl",
    "epoll_pwait",
    "epoll_wait",
    "eventfd2",
    "poll",
    "ppoll",
    "pselect6",
    "select",
    // clocks + sleep
    "clock_getres",
    "clock_gettime",
    "clock_nanosleep",
    "gettimeofday",
    "nanosleep",
    "times",
    // identity + system reads
    "getegid",
    "geteuid",
    "getgid",
    "getgroups",
    "getpgrp",
    "getpid",
    "getppid",
    "getrandom",
    "getresgid",
    "getresuid",
    "getrlimit",
    "getrusage",
    "getuid",
    "sysinfo",
    "uname",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: String,
}

/// Docker-shaped seccomp document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeccompProfile {
    pub default_action: String,
    pub architectures: Vec<String>,
    pub syscalls: Vec<SyscallRule>,
}

impl SeccompProfile {
    /// The VoidRunner default: deny with EPERM, allow the documented set.
    pub fn restricted() -> Self {
        Self {
            default_action: "SCMP_ACT_ERRNO".to_string(),
            architectures: vec![
                "SCMP_ARCH_X86_64".to_string(),
                "SCMP_ARCH_AARCH64".to_string(),
            ],
            syscalls: vec![SyscallRule {
                names: ALLOWED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
                action: "SCMP_ACT_ALLOW".to_string(),
            }],
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize seccomp profile")
    }
}

/// Writes the profile at startup and hands its content to the executor.
pub struct SeccompProfileManager {
    path: PathBuf,
    json: String,
}

impl SeccompProfileManager {
    /// Renders the restricted profile and writes it to `path` (mode
    /// 0600, atomic rename). Parent directories are created as needed.
    pub fn install(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let json = SeccompProfile::restricted().to_json()?;
        write_atomic(&path, &json)?;
        tracing::info!(path = %path.display(), "Seccomp profile written");
        Ok(Self { path, json })
    }

    /// Loads a previously installed profile instead of rewriting it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read seccomp profile at {}", path.display()))?;
        // Reject files that are not a seccomp document at all.
        let _: SeccompProfile =
            serde_json::from_str(&json).context("Seccomp profile file is not valid")?;
        Ok(Self { path, json })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw JSON, embedded into the container `security_opt`.
    pub fn json(&self) -> &str {
        &self.json
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create profile directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .context("Failed to create temporary profile file")?;
    tmp.write_all(content.as_bytes())
        .context("Failed to write seccomp profile")?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .context("Failed to set seccomp profile permissions")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist seccomp profile to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_denies_by_default() {
        let profile = SeccompProfile::restricted();
        assert_eq!(profile.default_action, "SCMP_ACT_ERRNO");
        assert_eq!(profile.syscalls.len(), 1);
        assert_eq!(profile.syscalls[0].action, "SCMP_ACT_ALLOW");
    }

    #[test]
    fn allowlist_covers_interpreter_basics_and_not_network() {
        let names = &SeccompProfile::restricted().syscalls[0].names;
        for required in ["read", "write", "execve", "mmap", "exit_group", "futex"] {
            assert!(names.iter().any(|n| n == required), "missing {}", required);
        }
        for denied in ["socket", "connect", "bind", "ptrace", "mount", "reboot"] {
            assert!(!names.iter().any(|n| n == denied), "must not allow {}", denied);
        }
    }

    #[test]
    fn json_uses_docker_field_names() {
        let json = SeccompProfile::restricted().to_json().unwrap();
        assert!(json.contains("\"defaultAction\""));
        assert!(json.contains("\"architectures\""));
        assert!(json.contains("\"syscalls\""));
    }

    #[test]
    fn install_writes_0600_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seccomp.json");
        let manager = SeccompProfileManager::install(&path).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let loaded = SeccompProfileManager::load(&path).unwrap();
        assert_eq!(loaded.json(), manager.json());
    }

    #[test]
    fn load_rejects_non_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.json");
        fs::write(&path, "{\"not\": \"a profile\"}").unwrap();
        assert!(SeccompProfileManager::load(&path).is_err());
    }
}
