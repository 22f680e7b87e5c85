//! Environment-driven configuration, parsed once at startup.

use std::time::Duration;

use opthub_protocol::SandboxLimits;
use opthub_sandbox::SandboxConfig;
use tracing::warn;

pub const WORKERS_ENV_VAR: &str = "OPTHUB_WORKERS";
pub const QUEUE_CAPACITY_ENV_VAR: &str = "OPTHUB_QUEUE_CAPACITY";
pub const JOB_HARD_TIMEOUT_SECS_ENV_VAR: &str = "OPTHUB_JOB_HARD_TIMEOUT_SECS";
pub const JOB_SOFT_GRACE_SECS_ENV_VAR: &str = "OPTHUB_JOB_SOFT_GRACE_SECS";
pub const MAX_RETRIES_ENV_VAR: &str = "OPTHUB_MAX_RETRIES";
pub const RETRY_BACKOFF_MS_ENV_VAR: &str = "OPTHUB_RETRY_BACKOFF_MS";
pub const RESULT_RETENTION_SECS_ENV_VAR: &str = "OPTHUB_RESULT_RETENTION_SECS";
pub const SUBSCRIBER_BUFFER_ENV_VAR: &str = "OPTHUB_SUBSCRIBER_BUFFER";
pub const SANDBOX_MEMORY_BYTES_ENV_VAR: &str = "OPTHUB_SANDBOX_MEMORY_BYTES";
pub const SANDBOX_CPU_SECS_ENV_VAR: &str = "OPTHUB_SANDBOX_CPU_SECS";
pub const SANDBOX_SCRATCH_BYTES_ENV_VAR: &str = "OPTHUB_SANDBOX_SCRATCH_BYTES";
pub const SANDBOX_UID_ENV_VAR: &str = "OPTHUB_SANDBOX_UID";

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool size; default = available parallelism.
    pub workers: usize,
    /// Bounded submission queue capacity.
    pub queue_capacity: usize,
    /// Wall-clock budget per job.
    pub hard_timeout: Duration,
    /// How long before the hard deadline cooperative cancellation starts.
    pub soft_grace: Duration,
    /// Retry budget for transient failure kinds.
    pub max_retries: u32,
    /// Base backoff, doubled per attempt.
    pub retry_backoff: Duration,
    /// How long terminal records stay before eviction; `None` = unlimited.
    pub retention: Option<Duration>,
    /// Per-subscriber event buffer; overflowing subscribers are dropped.
    pub subscriber_buffer: usize,
    pub sandbox_limits: SandboxLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            queue_capacity: 128,
            hard_timeout: Duration::from_secs(600),
            soft_grace: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            retention: Some(Duration::from_secs(3600)),
            subscriber_buffer: 64,
            sandbox_limits: SandboxLimits::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retention_secs: u64 = env_or(
            RESULT_RETENTION_SECS_ENV_VAR,
            defaults.retention.map(|d| d.as_secs()).unwrap_or(0),
        );
        Self {
            workers: env_or(WORKERS_ENV_VAR, defaults.workers).max(1),
            queue_capacity: env_or(QUEUE_CAPACITY_ENV_VAR, defaults.queue_capacity).max(1),
            hard_timeout: Duration::from_secs(
                env_or(JOB_HARD_TIMEOUT_SECS_ENV_VAR, defaults.hard_timeout.as_secs()).max(1),
            ),
            soft_grace: Duration::from_secs(env_or(
                JOB_SOFT_GRACE_SECS_ENV_VAR,
                defaults.soft_grace.as_secs(),
            )),
            max_retries: env_or(MAX_RETRIES_ENV_VAR, defaults.max_retries),
            retry_backoff: Duration::from_millis(env_or(
                RETRY_BACKOFF_MS_ENV_VAR,
                defaults.retry_backoff.as_millis() as u64,
            )),
            // 0 means unlimited retention.
            retention: (retention_secs > 0).then(|| Duration::from_secs(retention_secs)),
            subscriber_buffer: env_or(SUBSCRIBER_BUFFER_ENV_VAR, defaults.subscriber_buffer).max(2),
            sandbox_limits: SandboxLimits {
                memory_bytes: env_or(
                    SANDBOX_MEMORY_BYTES_ENV_VAR,
                    defaults.sandbox_limits.memory_bytes,
                ),
                cpu_secs: env_or(SANDBOX_CPU_SECS_ENV_VAR, defaults.sandbox_limits.cpu_secs),
                scratch_bytes: env_or(
                    SANDBOX_SCRATCH_BYTES_ENV_VAR,
                    defaults.sandbox_limits.scratch_bytes,
                ),
                uid: std::env::var(SANDBOX_UID_ENV_VAR)
                    .ok()
                    .and_then(|raw| raw.parse().ok()),
            },
        }
    }

    /// Sandbox executor settings derived from this config. The sandbox gets
    /// the same deadlines as the pool so the two layers agree on when a job
    /// is overdue.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            limits: self.sandbox_limits,
            hard_timeout: self.hard_timeout,
            soft_grace: self.soft_grace,
        }
    }
}

fn env_or<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparseable {name}={raw}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Config;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.workers >= 1);
        assert_eq!(config.max_retries, 2);
        assert!(config.soft_grace < config.hard_timeout);
        assert!(config.retention.is_some());
    }
}
