//! Exponential backoff retry policy.
//!
//! `delay = min(base_delay * 2^attempt_count, max_delay)`, with optional
//! jitter to avoid synchronized retry storms across many jobs.

use chrono::Duration;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay to jitter by, in `[0, 1]`. `0` disables
    /// jitter for deterministic tests.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::seconds(1),
            max_delay: Duration::minutes(5),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the attempt numbered `attempt_count` (0 after the first
    /// failure, 1 after the second, ...).
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let base_secs = self.base_delay.num_milliseconds() as f64 / 1000.0;
        let max_secs = self.max_delay.num_milliseconds() as f64 / 1000.0;
        let raw = base_secs * 2f64.powi(attempt_count as i32);
        let capped = raw.min(max_secs);

        let with_jitter = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            (capped + delta).max(1.0)
        } else {
            capped
        };

        Duration::milliseconds((with_jitter * 1000.0) as i64)
    }

    pub fn should_retry(attempts: u32, max_retries: u32) -> bool {
        attempts < max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_sequence_without_jitter() {
        let policy = RetryPolicy::new(Duration::seconds(1), Duration::minutes(5), 0.0);
        assert_eq!(policy.delay_for(0), Duration::seconds(1));
        assert_eq!(policy.delay_for(1), Duration::seconds(2));
        assert_eq!(policy.delay_for(2), Duration::seconds(4));
        assert_eq!(policy.delay_for(3), Duration::seconds(8));
    }

    #[test]
    fn caps_at_max_delay() {
        let policy = RetryPolicy::new(Duration::seconds(1), Duration::seconds(10), 0.0);
        assert_eq!(policy.delay_for(10), Duration::seconds(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(Duration::seconds(10), Duration::minutes(5), 0.5);
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::seconds(1));
            assert!(d <= Duration::seconds(15));
        }
    }

    #[test]
    fn should_retry_bound() {
        assert!(RetryPolicy::should_retry(0, 3));
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
    }
}
