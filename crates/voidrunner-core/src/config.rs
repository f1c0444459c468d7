//! Configuration module
//!
//! Environment-driven configuration for the API server, the broker, the
//! sandbox executor and the worker pool. `Config::from_env()` reads
//! plain environment variables (with `.env` support via dotenvy) and
//! `validate()` rejects inconsistent combinations before startup.

use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use std::str::FromStr;

use crate::models::ScriptLanguage;

// Common defaults
const DEFAULT_SERVER_PORT: u16 = 8080;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_TIMEOUT_SECS: u64 = 5;
const DEFAULT_JWT_EXPIRY_HOURS: i64 = 24;
const DEFAULT_QUEUE_DEPTH_CAP: usize = 10_000;
const DEFAULT_LEASE_SECS: u64 = 300;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 10;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 600;
const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_MAX_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_MEMORY_LIMIT_BYTES: i64 = 256 * 1024 * 1024;
const DEFAULT_PIDS_LIMIT: i64 = 128;
const DEFAULT_CPU_PERIOD_MICROS: i64 = 100_000;
const DEFAULT_CPU_QUOTA_MICROS: i64 = 50_000;
const DEFAULT_SANDBOX_UID: u32 = 65534;
const DEFAULT_SANDBOX_GID: u32 = 65534;
const DEFAULT_SECCOMP_PATH: &str = "/var/run/voidrunner/seccomp.json";
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_POOL_SIZE: usize = 16;
const DEFAULT_MIN_POOL_SIZE: usize = 1;
const DEFAULT_SCALING_INTERVAL_SECS: u64 = 30;
const DEFAULT_SCALE_HIGH_WATER: usize = 50;
const DEFAULT_SCALE_LOW_WATER: usize = 5;
const DEFAULT_PER_USER_CAP: usize = 2;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALE_CHECK_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALE_THRESHOLD_SECS: i64 = 3900;
const DEFAULT_MAX_SCRIPT_BYTES: usize = 64 * 1024;

fn env_or<T>(key: &str, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: Debug,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub environment: String,
    pub max_body_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Per-operation timeout for repository calls.
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub auth_failure_max: u32,
    pub auth_failure_window_secs: u64,
}

/// Broker-side queue tuning.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Enqueue fails with `resource-exhausted` once primary holds this many.
    pub depth_cap: usize,
    /// Visibility lease granted to a worker per delivery. Must exceed the
    /// longest execution timeout plus a safety margin or redelivery storms
    /// follow.
    pub lease_seconds: u64,
    pub heartbeat_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub max_attempts: i32,
}

/// Sandbox executor tuning and security toggles.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Language tag -> container image.
    pub images: HashMap<ScriptLanguage, String>,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub memory_limit_bytes: i64,
    pub cpu_period_micros: i64,
    pub cpu_quota_micros: i64,
    pub pids_limit: i64,
    /// Upper bound applied over per-task timeouts.
    pub max_timeout_secs: u64,
    /// Per-stream stdout/stderr capture cap.
    pub max_output_bytes: usize,
    pub seccomp_enabled: bool,
    pub seccomp_profile_path: String,
    /// AppArmor profile name; must already be loaded on the host.
    pub apparmor_profile: Option<String>,
    /// Fall back to the deterministic mock executor when the container
    /// runtime is unreachable at startup.
    pub fallback_to_mock: bool,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_prefix: String,
    /// Idle wait between lease attempts when primary is empty.
    pub poll_interval_ms: u64,
    pub initial_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub autoscale_enabled: bool,
    pub scaling_check_interval_secs: u64,
    /// Primary queue depth above which the pool grows.
    pub scale_up_watermark: usize,
    /// Primary queue depth below which idle workers retire.
    pub scale_down_watermark: usize,
    pub per_user_cap: usize,
    pub per_language_cap: Option<usize>,
    pub shutdown_timeout_secs: u64,
    pub stale_check_interval_secs: u64,
    /// Age after which a running execution without a live heartbeat is
    /// reaped as failed.
    pub stale_threshold_secs: i64,
}

#[derive(Clone, Debug)]
pub struct LimitsConfig {
    pub max_script_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub worker: WorkerConfig,
    pub limits: LimitsConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        // Load .env if present; real environment always wins.
        let _ = dotenvy::dotenv();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;

        let mut images = HashMap::new();
        images.insert(
            ScriptLanguage::Python,
            env_opt("EXECUTOR_IMAGE_PYTHON").unwrap_or_else(|| "python:3.12-alpine".to_string()),
        );
        images.insert(
            ScriptLanguage::Javascript,
            env_opt("EXECUTOR_IMAGE_JAVASCRIPT").unwrap_or_else(|| "node:20-alpine".to_string()),
        );
        images.insert(
            ScriptLanguage::Bash,
            env_opt("EXECUTOR_IMAGE_BASH").unwrap_or_else(|| "bash:5.2-alpine3.20".to_string()),
        );
        images.insert(
            ScriptLanguage::Go,
            env_opt("EXECUTOR_IMAGE_GO").unwrap_or_else(|| "golang:1.22-alpine".to_string()),
        );

        let config = Config {
            server: ServerConfig {
                port: env_or("SERVER_PORT", DEFAULT_SERVER_PORT)?,
                cors_origins: env_opt("CORS_ORIGINS")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                environment: env_opt("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
                max_body_bytes: env_or("MAX_BODY_BYTES", 256 * 1024)?,
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_or("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
                timeout_seconds: env_or("DB_TIMEOUT_SECONDS", DEFAULT_DB_TIMEOUT_SECS)?,
            },
            auth: AuthConfig {
                jwt_secret,
                jwt_expiry_hours: env_or("JWT_EXPIRY_HOURS", DEFAULT_JWT_EXPIRY_HOURS)?,
                auth_failure_max: env_or("AUTH_FAILURE_MAX", 10)?,
                auth_failure_window_secs: env_or("AUTH_FAILURE_WINDOW_SECONDS", 300)?,
            },
            queue: QueueConfig {
                redis_url: env_opt("REDIS_URL")
                    .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
                depth_cap: env_or("QUEUE_DEPTH_CAP", DEFAULT_QUEUE_DEPTH_CAP)?,
                lease_seconds: env_or("QUEUE_LEASE_SECONDS", DEFAULT_LEASE_SECS)?,
                heartbeat_interval_secs: env_or(
                    "WORKER_HEARTBEAT_INTERVAL_SECONDS",
                    DEFAULT_HEARTBEAT_INTERVAL_SECS,
                )?,
                sweep_interval_secs: env_or("QUEUE_SWEEP_INTERVAL_SECONDS", DEFAULT_SWEEP_INTERVAL_SECS)?,
                backoff_base_secs: env_or("RETRY_BACKOFF_BASE_SECONDS", DEFAULT_BACKOFF_BASE_SECS)?,
                backoff_max_secs: env_or("RETRY_BACKOFF_MAX_SECONDS", DEFAULT_BACKOFF_MAX_SECS)?,
                max_attempts: env_or("QUEUE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            },
            executor: ExecutorConfig {
                images,
                sandbox_uid: env_or("SANDBOX_UID", DEFAULT_SANDBOX_UID)?,
                sandbox_gid: env_or("SANDBOX_GID", DEFAULT_SANDBOX_GID)?,
                memory_limit_bytes: env_or("SANDBOX_MEMORY_LIMIT_BYTES", DEFAULT_MEMORY_LIMIT_BYTES)?,
                cpu_period_micros: env_or("SANDBOX_CPU_PERIOD_MICROS", DEFAULT_CPU_PERIOD_MICROS)?,
                cpu_quota_micros: env_or("SANDBOX_CPU_QUOTA_MICROS", DEFAULT_CPU_QUOTA_MICROS)?,
                pids_limit: env_or("SANDBOX_PIDS_LIMIT", DEFAULT_PIDS_LIMIT)?,
                max_timeout_secs: env_or("SANDBOX_MAX_TIMEOUT_SECONDS", DEFAULT_MAX_TIMEOUT_SECS)?,
                max_output_bytes: env_or("SANDBOX_MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES)?,
                seccomp_enabled: env_or("SANDBOX_SECCOMP_ENABLED", true)?,
                seccomp_profile_path: env_opt("SANDBOX_SECCOMP_PROFILE_PATH")
                    .unwrap_or_else(|| DEFAULT_SECCOMP_PATH.to_string()),
                apparmor_profile: env_opt("SANDBOX_APPARMOR_PROFILE"),
                fallback_to_mock: env_or("EXECUTOR_FALLBACK_TO_MOCK", true)?,
            },
            worker: WorkerConfig {
                worker_prefix: env_opt("WORKER_PREFIX").unwrap_or_else(|| "voidrunner".to_string()),
                poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?,
                initial_pool_size: env_or("WORKER_POOL_SIZE", DEFAULT_POOL_SIZE)?,
                min_pool_size: env_or("WORKER_MIN_POOL_SIZE", DEFAULT_MIN_POOL_SIZE)?,
                max_pool_size: env_or("WORKER_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?,
                autoscale_enabled: env_or("WORKER_AUTOSCALE_ENABLED", false)?,
                scaling_check_interval_secs: env_or(
                    "WORKER_SCALING_CHECK_INTERVAL_SECONDS",
                    DEFAULT_SCALING_INTERVAL_SECS,
                )?,
                scale_up_watermark: env_or("WORKER_SCALE_UP_WATERMARK", DEFAULT_SCALE_HIGH_WATER)?,
                scale_down_watermark: env_or("WORKER_SCALE_DOWN_WATERMARK", DEFAULT_SCALE_LOW_WATER)?,
                per_user_cap: env_or("WORKER_PER_USER_CAP", DEFAULT_PER_USER_CAP)?,
                per_language_cap: env_opt("WORKER_PER_LANGUAGE_CAP")
                    .map(|v| v.parse())
                    .transpose()
                    .map_err(|e| anyhow::anyhow!("Invalid WORKER_PER_LANGUAGE_CAP: {}", e))?,
                shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECONDS", DEFAULT_SHUTDOWN_TIMEOUT_SECS)?,
                stale_check_interval_secs: env_or(
                    "STALE_CHECK_INTERVAL_SECONDS",
                    DEFAULT_STALE_CHECK_INTERVAL_SECS,
                )?,
                stale_threshold_secs: env_or("STALE_THRESHOLD_SECONDS", DEFAULT_STALE_THRESHOLD_SECS)?,
            },
            limits: LimitsConfig {
                max_script_bytes: env_or("MAX_SCRIPT_BYTES", DEFAULT_MAX_SCRIPT_BYTES)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        let env = self.server.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.auth.jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 bytes");
        }
        if self.queue.max_attempts < 1 {
            anyhow::bail!("QUEUE_MAX_ATTEMPTS must be at least 1");
        }
        if self.queue.backoff_base_secs == 0 {
            anyhow::bail!("RETRY_BACKOFF_BASE_SECONDS must be nonzero");
        }
        if self.queue.backoff_max_secs < self.queue.backoff_base_secs {
            anyhow::bail!("RETRY_BACKOFF_MAX_SECONDS must be >= the base delay");
        }
        // A lease shorter than the execution ceiling guarantees redelivery
        // of messages that are still being worked.
        if self.queue.lease_seconds <= self.queue.heartbeat_interval_secs {
            anyhow::bail!("QUEUE_LEASE_SECONDS must exceed the heartbeat interval");
        }
        if self.worker.min_pool_size > self.worker.max_pool_size {
            anyhow::bail!("WORKER_MIN_POOL_SIZE must be <= WORKER_MAX_POOL_SIZE");
        }
        if self.worker.initial_pool_size < self.worker.min_pool_size
            || self.worker.initial_pool_size > self.worker.max_pool_size
        {
            anyhow::bail!("WORKER_POOL_SIZE must lie within [min, max] pool bounds");
        }
        if self.worker.per_user_cap == 0 {
            anyhow::bail!("WORKER_PER_USER_CAP must be at least 1");
        }
        if self.executor.cpu_quota_micros > self.executor.cpu_period_micros * 64 {
            anyhow::bail!("SANDBOX_CPU_QUOTA_MICROS is implausibly large");
        }
        if self.executor.max_output_bytes == 0 {
            anyhow::bail!("SANDBOX_MAX_OUTPUT_BYTES must be nonzero");
        }
        for lang in ScriptLanguage::ALL {
            if !self.executor.images.contains_key(&lang) {
                anyhow::bail!("No sandbox image configured for language {}", lang);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut images = HashMap::new();
        for lang in ScriptLanguage::ALL {
            images.insert(lang, format!("voidrunner-{}:latest", lang));
        }
        Config {
            server: ServerConfig {
                port: 8080,
                cors_origins: vec![],
                environment: "test".into(),
                max_body_bytes: 256 * 1024,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/voidrunner".into(),
                max_connections: 5,
                timeout_seconds: 5,
            },
            auth: AuthConfig {
                jwt_secret: "0123456789abcdef0123456789abcdef".into(),
                jwt_expiry_hours: 24,
                auth_failure_max: 10,
                auth_failure_window_secs: 300,
            },
            queue: QueueConfig {
                redis_url: "redis://127.0.0.1:6379".into(),
                depth_cap: 100,
                lease_seconds: 300,
                heartbeat_interval_secs: 10,
                sweep_interval_secs: 5,
                backoff_base_secs: 10,
                backoff_max_secs: 600,
                max_attempts: 3,
            },
            executor: ExecutorConfig {
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
            },
            worker: WorkerConfig {
                worker_prefix: "voidrunner".into(),
                poll_interval_ms: 1000,
                initial_pool_size: 2,
                min_pool_size: 1,
                max_pool_size: 4,
                autoscale_enabled: false,
                scaling_check_interval_secs: 30,
                scale_up_watermark: 50,
                scale_down_watermark: 5,
                per_user_cap: 2,
                per_language_cap: None,
                shutdown_timeout_secs: 30,
                stale_check_interval_secs: 60,
                stale_threshold_secs: 3900,
            },
            limits: LimitsConfig {
                max_script_bytes: 64 * 1024,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn short_jwt_secret_rejected() {
        let mut config = base_config();
        config.auth.jwt_secret = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_must_exceed_heartbeat() {
        let mut config = base_config();
        config.queue.lease_seconds = 10;
        config.queue.heartbeat_interval_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_bounds_enforced() {
        let mut config = base_config();
        config.worker.initial_pool_size = 10;
        assert!(config.validate().is_err());
        config.worker.initial_pool_size = 2;
        config.worker.min_pool_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_image_rejected() {
        let mut config = base_config();
        config.executor.images.remove(&ScriptLanguage::Go);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("go"), "unexpected error: {}", err);
    }
}
