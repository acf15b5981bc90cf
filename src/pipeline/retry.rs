//! Backoff and rate-limit delays.
//!
//! Both the coordinator (page retries) and the workers (item retries,
//! queue transport errors) compute delays from the same `RetryPolicy`.

use std::time::Duration;

use crate::models::{RateLimit, RetryPolicy};

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, fastrand::f64())
    }

    /// `base * multiplier^(attempt-1)` plus `jitter_ratio * sample` of that
    /// delay, never more than `max_delay_ms`. `sample` is in `[0, 1)`.
    pub fn backoff_with(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        let jitter = capped * self.jitter_ratio * sample.clamp(0.0, 1.0);
        Duration::from_millis((capped + jitter).min(self.max_delay_ms as f64) as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl RateLimit {
    /// Randomized pause after one processed item.
    pub fn delay(&self) -> Duration {
        self.delay_with(fastrand::f64())
    }

    /// Uniform within `base ± base * jitter_ratio`; `sample` is in `[0, 1)`.
    pub fn delay_with(&self, sample: f64) -> Duration {
        let base = self.base_delay_ms as f64;
        let spread = base * self.jitter_ratio;
        let ms = base - spread + 2.0 * spread * sample.clamp(0.0, 1.0);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter_ratio: 0.5,
            page_retries: 2,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy();
        assert_eq!(p.backoff_with(1, 0.0), Duration::from_millis(100));
        assert_eq!(p.backoff_with(2, 0.0), Duration::from_millis(200));
        assert_eq!(p.backoff_with(3, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let p = policy();
        assert_eq!(p.backoff_with(10, 0.0), Duration::from_millis(1_000));
        assert_eq!(p.backoff_with(u32::MAX, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let p = policy();
        assert_eq!(p.backoff_with(2, 1.0), Duration::from_millis(300));
        for _ in 0..100 {
            let d = p.backoff(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let p = policy();
        assert_eq!(p.backoff_with(10, 1.0), Duration::from_millis(1_000));
        assert_eq!(p.backoff_with(4, 0.99), Duration::from_millis(1_000));
        for _ in 0..100 {
            assert!(p.backoff(20) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_zero_attempt_treated_as_first() {
        assert_eq!(policy().backoff_with(0, 0.0), Duration::from_millis(100));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy();
        assert!(!p.is_exhausted(3));
        assert!(p.is_exhausted(4));
    }

    #[test]
    fn test_rate_limit_window() {
        let limit = RateLimit {
            base_delay_ms: 1_000,
            jitter_ratio: 0.5,
        };
        assert_eq!(limit.delay_with(0.0), Duration::from_millis(500));
        assert_eq!(limit.delay_with(0.5), Duration::from_millis(1_000));
        for _ in 0..100 {
            let d = limit.delay();
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1_500));
        }
    }
}
