//! Retry policy used by the store writer: capped exponential backoff with
//! full jitter, bounded by an attempt budget. The policy is a plain value
//! object so retry behavior can be tested without touching real I/O.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetryPolicy {
    base_delay: Duration,
    cap_delay: Duration,
    max_attempts: u16,
    jitter: bool,
}

impl RetryPolicy {
    pub(crate) fn new(base_delay: Duration, cap_delay: Duration, max_attempts: u16) -> Self {
        RetryPolicy {
            base_delay,
            cap_delay,
            max_attempts,
            jitter: true,
        }
    }

    /// Total number of attempts `write` may make, the first one included.
    pub(crate) fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    pub(crate) fn cap_delay(&self) -> Duration {
        self.cap_delay
    }

    /// Delay to sleep after the given failed attempt (1-based). Doubles per
    /// attempt, capped, then drawn uniformly from `0..=delay` (full jitter)
    /// so concurrent tasks do not hammer a recovering store in lockstep.
    pub(crate) fn delay_after(&self, attempt: u16) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20) as u32;
        let uncapped = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << exponent);
        let capped = uncapped.min(self.cap_delay.as_millis()) as u64;
        if !self.jitter {
            return Duration::from_millis(capped);
        }
        Duration::from_millis(rand::rng().random_range(0..=capped))
    }

    #[cfg(test)]
    pub(crate) fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.cap_delay_ms),
            config.max_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let policy =
            RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 10).without_jitter();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(7), Duration::from_millis(30_000));
        assert_eq!(policy.delay_after(12), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_the_computed_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 5);
        for attempt in 1..=5 {
            let delay = policy.delay_after(attempt);
            assert!(delay <= Duration::from_secs(1));
        }
    }

    #[test]
    fn large_attempt_numbers_do_not_overflow() {
        let policy =
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), u16::MAX).without_jitter();
        assert_eq!(policy.delay_after(u16::MAX), Duration::from_secs(30));
    }

    #[test]
    fn built_from_retry_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.cap_delay(), Duration::from_secs(30));
    }
}
