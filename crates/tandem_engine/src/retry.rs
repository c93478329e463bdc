//! Retry decisions and exponential backoff.

use crate::config::RetryConfig;
use crate::error::SyncError;
use rand::Rng;
use std::time::Duration;

/// What to do with a job whose delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Abandon the job; no automatic attempts remain.
    DeadLetter,
}

/// Applies the configured backoff to failed operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Policy over `config`.
    pub fn new(config: RetryConfig) -> RetryPolicy {
        RetryPolicy { config }
    }

    /// Decides the fate of a job that failed with `error` on its
    /// `attempt`-th delivery (1-based).
    ///
    /// Permanent errors dead-letter immediately; transient errors retry with
    /// exponential backoff until `max_attempts` is exhausted.
    pub fn assess(&self, error: &SyncError, attempt: u32, max_attempts: u32) -> RetryDecision {
        if !error.is_transient() || attempt >= max_attempts {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry {
            delay: self.delay_for_attempt(attempt),
        }
    }

    /// Backoff after the `attempt`-th delivery: `base * 2^(attempt-1)`,
    /// capped at `max_delay`, with optional ±25% jitter.
    ///
    /// Attempt 0 means "never delivered" and gets no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.config.base_delay.as_millis() as u64;
        let raw_ms = base_ms.saturating_mul(1u64 << exponent);
        let capped_ms = raw_ms.min(self.config.max_delay.as_millis() as u64);
        if !self.config.jitter || capped_ms < 4 {
            return Duration::from_millis(capped_ms);
        }
        let spread = capped_ms / 4;
        let offset = rand::thread_rng().gen_range(0..=spread * 2);
        Duration::from_millis(capped_ms - spread + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_model::SystemKind;

    fn deterministic() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default().without_jitter())
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = deterministic();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let policy = RetryPolicy::new(RetryConfig::default());
        for _ in 0..64 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(3_750), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(6_250), "delay {delay:?}");
        }
    }

    #[test]
    fn transient_errors_retry_until_exhausted() {
        let policy = deterministic();
        let err = SyncError::transient(SystemKind::Crm, "503");
        assert_eq!(
            policy.assess(&err, 1, 3),
            RetryDecision::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            policy.assess(&err, 2, 3),
            RetryDecision::Retry {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(policy.assess(&err, 3, 3), RetryDecision::DeadLetter);
    }

    #[test]
    fn permanent_errors_dead_letter_immediately() {
        let policy = deterministic();
        let err = SyncError::from_status(SystemKind::Crm, 422, "bad payload");
        assert_eq!(policy.assess(&err, 1, 3), RetryDecision::DeadLetter);
    }
}
