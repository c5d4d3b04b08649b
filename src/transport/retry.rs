//! Reconnect backoff
//!
//! Exponential backoff with a cap and ±jitter, reset after every successful
//! connection.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy for a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// First delay after a failure
    pub initial_backoff_ms: u64,

    /// Delay ceiling
    pub max_backoff_ms: u64,

    /// Growth factor between attempts
    pub multiplier: f64,

    /// Relative jitter applied to every delay (0.25 = ±25%)
    pub jitter: f64,

    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            multiplier: 2.0,
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 || self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry",
                reason: "backoff must be positive and maxBackoffMs >= initialBackoffMs"
                    .to_string(),
            });
        }
        if self.multiplier < 1.0 || !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid {
                field: "retry",
                reason: "multiplier must be >= 1 and jitter in [0, 1)".to_string(),
            });
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                field: "maxAttempts",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Stateful delay sequence for one channel
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Un-jittered delay for the current attempt count
    pub fn base_delay(&self) -> Duration {
        let exp = self.attempts.saturating_sub(1).min(32) as i32;
        let raw = self.policy.initial_backoff_ms as f64 * self.policy.multiplier.powi(exp);
        let capped = raw.min(self.policy.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Record a failure and return how long to wait, or `None` when the
    /// attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.attempts > max {
                return None;
            }
        }

        let base = self.base_delay().as_millis() as f64;
        let spread = base * self.policy.jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * spread;
        let delay = (base + jitter).clamp(0.0, self.policy.max_backoff_ms as f64);
        Some(Duration::from_millis(delay as u64))
    }

    /// Forget previous failures after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        };
        let mut backoff = policy.backoff();
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = RetryPolicy::default().backoff();
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().unwrap().as_millis() as u64;
            assert!((150..=250).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_max_attempts_and_reset() {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..Default::default()
        };
        let mut backoff = policy.backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        let policy = RetryPolicy {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
