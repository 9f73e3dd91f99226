//! Backoff policies for failed jobs.
//!
//! Whether a job is retried at all is decided by its attempt budget
//! (`attempts_made < max_attempts`) and by the error kind; the policy here
//! only computes how long to wait before the next attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskline_config::{BackoffKind, RetryConfig};

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry without waiting.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
    /// Linear backoff.
    Linear,
}

impl From<BackoffKind> for RetryStrategy {
    fn from(kind: BackoffKind) -> Self {
        match kind {
            BackoffKind::None => RetryStrategy::None,
            BackoffKind::Fixed => RetryStrategy::Fixed,
            BackoffKind::Linear => RetryStrategy::Linear,
            BackoffKind::Exponential => RetryStrategy::Exponential,
        }
    }
}

/// Backoff policy attached to each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier (exponential only).
    pub multiplier: f64,

    /// Add random jitter to delays.
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Creates a policy that retries immediately.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = duration_ms(delay);
        Self {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff policy: `initial * 2^(attempt - 1)`.
    pub fn exponential(initial: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: duration_ms(initial),
            max_delay_ms: 3_600_000, // 1 hour
            multiplier: 2.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates a linear backoff policy: `increment * attempt`.
    pub fn linear(increment: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            initial_delay_ms: duration_ms(increment),
            max_delay_ms: 3_600_000,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = true;
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before the next attempt, given how many attempts have failed.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 || self.strategy == RetryStrategy::None {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempts_made - 1).unwrap_or(i32::MAX);
                let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
                if delay.is_finite() && delay < u64::MAX as f64 {
                    delay as u64
                } else {
                    u64::MAX
                }
            }
            RetryStrategy::Linear => self.initial_delay_ms.saturating_mul(u64::from(attempts_made)),
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter && self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            let jitter = rand_jitter(jitter_range);
            capped_delay.saturating_add(jitter).saturating_sub(jitter_range / 2)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let policy = Self {
            strategy: config.strategy.into(),
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter: false,
            jitter_factor: 0.0,
        };
        if config.jitter {
            policy.with_jitter(0.1)
        } else {
            policy
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Generate random jitter using a simple LCG.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    // LCG parameters
    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    let random = seed.wrapping_mul(a).wrapping_add(c);
    random % range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delay() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(7), Duration::ZERO);
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::linear(Duration::from_secs(1));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_near_base() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1000)).with_jitter(0.2);
        let delay = policy.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(900));
        assert!(delay <= Duration::from_millis(1100));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            strategy: BackoffKind::Linear,
            initial_delay_ms: 250,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.strategy, RetryStrategy::Linear);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert!(!policy.jitter);
    }
}
