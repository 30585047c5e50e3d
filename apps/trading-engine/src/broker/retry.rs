//! Retry policy with exponential backoff and jitter for broker reads.
//!
//! Writes are never retried: without the deterministic client-order-id
//! round trip a resubmission is not idempotent at the broker, so the retry
//! decision belongs to the caller.

use std::time::Duration;

use rand::Rng;

/// Retry policy for read-only broker calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first call.
    pub max_attempts: u32,
    /// Base backoff before the first retry.
    pub base_backoff: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Jitter range applied multiplicatively: [min, max].
    pub jitter: (f64, f64),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            factor: 2.0,
            jitter: (0.5, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), jittered.
    ///
    /// Returns `None` once attempts are exhausted.
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let base_ms = self.base_backoff.as_secs_f64() * 1000.0;
        let scaled = base_ms * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::rng().random_range(self.jitter.0..=self.jitter.1);
        Some(Duration::from_secs_f64((scaled * jitter) / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_backoff, Duration::from_millis(100));
        assert!((policy.factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn backoff_exhausts_after_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff_for(1).is_some());
        assert!(policy.backoff_for(2).is_some());
        assert!(policy.backoff_for(3).is_none());
    }

    #[test]
    fn backoff_grows_and_stays_in_jitter_range() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(100),
            factor: 2.0,
            jitter: (0.5, 1.0),
        };
        for _ in 0..50 {
            let first = policy.backoff_for(1).unwrap();
            // 100ms * [0.5, 1.0]
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

            let second = policy.backoff_for(2).unwrap();
            // 200ms * [0.5, 1.0]
            assert!(second >= Duration::from_millis(100) && second <= Duration::from_millis(200));
        }
    }

    #[test]
    fn no_jitter_is_deterministic() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            factor: 2.0,
            jitter: (1.0, 1.0),
        };
        assert_eq!(policy.backoff_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.backoff_for(2), Some(Duration::from_millis(200)));
    }
}
