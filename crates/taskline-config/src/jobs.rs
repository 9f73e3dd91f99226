//! Job engine configuration sections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Worker loop configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Defaults applied to newly enqueued jobs.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Default retry/backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity written into claimed jobs. Generated when unset.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Number of concurrent processing slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle sleep when no job is eligible, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Sleep after a store error, in milliseconds.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,

    /// Lease length granted on claim and on each renewal, in milliseconds.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_ms: u64,

    /// Interval between lease renewals while a handler runs, in milliseconds.
    #[serde(default = "default_lease_renew_interval")]
    pub lease_renew_interval_ms: u64,

    /// Interval between delayed-promotion and stalled-recovery sweeps, in milliseconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            error_backoff_ms: default_error_backoff(),
            lease_duration_ms: default_lease_duration(),
            lease_renew_interval_ms: default_lease_renew_interval(),
            maintenance_interval_ms: default_maintenance_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_error_backoff() -> u64 {
    5000
}

fn default_lease_duration() -> u64 {
    30_000
}

fn default_lease_renew_interval() -> u64 {
    15_000
}

fn default_maintenance_interval() -> u64 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the post-error sleep as Duration.
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Returns lease duration as Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Returns the renewal interval, clamped below the lease duration.
    ///
    /// A zero interval, or one at or above the lease length, falls back to
    /// half the lease.
    pub fn lease_renew_interval(&self) -> Duration {
        if self.lease_renew_interval_ms == 0
            || self.lease_renew_interval_ms >= self.lease_duration_ms
        {
            Duration::from_millis(self.lease_duration_ms / 2)
        } else {
            Duration::from_millis(self.lease_renew_interval_ms)
        }
    }

    /// Returns maintenance interval as Duration.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Defaults applied to jobs that do not override them at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total attempts allowed per job (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Delete jobs once they finish successfully.
    #[serde(default = "default_remove_on_complete")]
    pub remove_on_complete: bool,

    /// Delete jobs once they fail terminally.
    #[serde(default)]
    pub remove_on_fail: bool,

    /// Number of stalled recoveries tolerated before a job is failed.
    #[serde(default = "default_max_stalled")]
    pub max_stalled: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            remove_on_complete: default_remove_on_complete(),
            remove_on_fail: false,
            max_stalled: default_max_stalled(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_remove_on_complete() -> bool {
    true
}

fn default_max_stalled() -> u32 {
    3
}

/// Backoff strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Retry without waiting.
    None,
    /// Same delay every time.
    Fixed,
    /// Delay grows by a constant step.
    Linear,
    /// Delay multiplies on each attempt.
    #[default]
    Exponential,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: BackoffKind,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add random jitter to computed delays.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::default(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

fn default_initial_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    3_600_000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.error_backoff(), Duration::from_secs(5));
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.lease_renew_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_renew_interval_clamped_below_lease() {
        let config = WorkerConfig {
            lease_duration_ms: 10_000,
            lease_renew_interval_ms: 20_000,
            ..WorkerConfig::default()
        };
        assert_eq!(config.lease_renew_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.default_max_attempts, 1);
        assert!(config.remove_on_complete);
        assert!(!config.remove_on_fail);
        assert_eq!(config.max_stalled, 3);
    }

    #[test]
    fn test_backoff_kind_deserialize() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"strategy":"fixed","initial_delay_ms":250}"#).unwrap();
        assert_eq!(config.strategy, BackoffKind::Fixed);
        assert_eq!(config.initial_delay_ms, 250);
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
    }
}
