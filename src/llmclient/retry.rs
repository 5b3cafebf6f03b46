// Retry policy: bounded exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Statuses worth another attempt. Everything else bubbles up immediately.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Retry policy for transient failures. The zero value disables retries
/// entirely (a single attempt, no sleeping).
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay randomized in either direction,
    /// e.g. 0.2 spreads each sleep across ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Total attempts to make, never less than one.
    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff before retry number `attempt` (zero-based: the sleep after the
    /// first failure is `delay_for(0)`).
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exp = attempt.min(16);
        let mut delay = self.base_delay.saturating_mul(1u32 << exp);
        if !self.max_delay.is_zero() && delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            let adjusted = delay.as_secs_f64() * (1.0 + spread);
            delay = Duration::from_secs_f64(adjusted.max(0.0));
        }

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn test_zero_policy_is_single_attempt() {
        let policy = RetryPolicy::disabled();
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
            0.0,
        );
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            0.5,
        );
        for _ in 0..100 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }
}
