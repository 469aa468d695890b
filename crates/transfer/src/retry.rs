use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-chunk retry limits with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per chunk, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
    /// Adds ±25% jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if a chunk that has been attempted `attempts` times
    /// may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter || capped <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((capped + capped * 0.25 * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(15));
        assert!(policy.jitter);
    }

    #[test]
    fn should_retry_counts_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn backoff_without_jitter() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        let expected_ms = [250, 500, 1000, 2000, 4000, 8000, 15000, 15000];
        for (i, &ms) in expected_ms.iter().enumerate() {
            assert_eq!(
                policy.delay_for_retry((i + 1) as u32),
                Duration::from_millis(ms)
            );
        }
    }

    #[test]
    fn backoff_with_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = policy.delay_for_retry((i + 1) as u32).as_secs_f64();
            assert!(
                secs >= base * 0.74 && secs <= base * 1.26,
                "retry {}: {secs}s outside band around {base}s",
                i + 1
            );
        }
    }

    #[test]
    fn huge_retry_number_does_not_overflow() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(15));
    }
}
