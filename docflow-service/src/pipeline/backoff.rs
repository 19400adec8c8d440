//! Exponential backoff shared by in-process retries and queue redelivery.

use std::time::Duration;

/// `delay(attempt) = min(base * factor^attempt, max)`, attempt zero-based.
///
/// Only constructible through [`BackoffPolicy::new`] so the factor is
/// always at least 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Factors below 1.0 (or NaN) are raised to 1.0 so delays never shrink.
    pub fn new(base_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        let backoff_factor = if backoff_factor >= 1.0 {
            backoff_factor
        } else {
            1.0
        };
        Self {
            base_delay,
            backoff_factor,
            max_delay,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
    }

    #[test]
    fn test_capped_for_huge_attempts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1_000), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_non_decreasing() {
        let policies = [
            BackoffPolicy::default(),
            BackoffPolicy::new(Duration::from_millis(500), 2.0, Duration::from_secs(60)),
            BackoffPolicy::new(Duration::from_secs(60), 2.0, Duration::from_secs(3600)),
            BackoffPolicy::new(Duration::from_millis(3), 1.5, Duration::from_millis(700)),
            BackoffPolicy::new(Duration::from_secs(1), 0.5, Duration::from_secs(10)),
        ];
        for policy in policies {
            let mut previous = Duration::ZERO;
            for attempt in 0..64 {
                let delay = policy.delay(attempt);
                assert!(delay >= previous, "{policy:?} decreased at {attempt}");
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_matches_formula() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), 3.0, Duration::from_secs(30));
        for attempt in 0..10u32 {
            let expected = (0.25 * 3f64.powi(attempt as i32)).min(30.0);
            let actual = policy.delay(attempt).as_secs_f64();
            assert!((actual - expected).abs() < 1e-6, "attempt {attempt}");
        }
    }

    #[test]
    fn test_zero_base_never_waits() {
        let policy = BackoffPolicy::new(Duration::ZERO, 2.0, Duration::from_secs(5));
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(40), Duration::ZERO);
    }

    #[test]
    fn test_factor_below_one_is_clamped() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), 0.1, Duration::from_secs(10));
        assert_eq!(policy.backoff_factor, 1.0);
        assert_eq!(policy.delay(3), Duration::from_secs(2));

        let policy = BackoffPolicy::new(Duration::from_secs(2), f64::NAN, Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn test_configured_factor_is_clamped() {
        let config = crate::config::QueueConfig {
            retry_factor: 0.25,
            ..crate::config::QueueConfig::default()
        };
        let backoff = config.retry_backoff();
        assert_eq!(backoff.delay(0), Duration::from_secs(60));
        assert_eq!(backoff.delay(4), Duration::from_secs(60));
    }
}
