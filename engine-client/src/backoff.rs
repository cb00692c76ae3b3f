//! Reconnect delays: exponential, capped, jittered.

use rand::Rng;
use std::time::Duration;

/// Backoff policy for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// No delay exceeds this.
    pub cap: Duration,
    /// Fraction of the delay randomized in each direction, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(10),
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// The un-jittered delay for `attempt` (0-indexed): `base * 2^attempt`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// The delay to wait before attempt number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 {
            return ceiling;
        }

        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        ceiling.mul_f64(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubles_until_cap() {
        let backoff = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff =
            BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.5);
        for _ in 0..200 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_millis(200), "{:?}", delay);
            assert!(delay <= Duration::from_millis(600), "{:?}", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff =
            BackoffConfig::new(Duration::from_millis(100), Duration::from_millis(150)).with_jitter(1.0);
        for attempt in 0..10 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        assert_eq!(BackoffConfig::default().with_jitter(7.0).jitter, 1.0);
        assert_eq!(BackoffConfig::default().with_jitter(-1.0).jitter, 0.0);
        assert_eq!(BackoffConfig::default().with_jitter(f64::NAN).jitter, 0.0);
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let backoff = BackoffConfig::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.cap, Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_ceiling_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
            attempt in 0u32..100,
        ) {
            let backoff = BackoffConfig::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            let here = backoff.ceiling(attempt);
            let next = backoff.ceiling(attempt + 1);
            prop_assert!(here <= next);
            prop_assert!(next <= backoff.cap);
            prop_assert!(here >= backoff.base.min(backoff.cap));
        }

        #[test]
        fn prop_jittered_delay_within_bounds(
            base_ms in 1u64..1_000,
            attempt in 0u32..20,
            jitter in 0.0f64..=1.0,
        ) {
            let backoff = BackoffConfig::new(
                Duration::from_millis(base_ms),
                Duration::from_secs(30),
            )
            .with_jitter(jitter);
            let ceiling = backoff.ceiling(attempt).as_secs_f64();
            let delay = backoff.delay(attempt).as_secs_f64();
            prop_assert!(delay <= backoff.cap.as_secs_f64() + 1e-9);
            prop_assert!(delay >= ceiling * (1.0 - jitter) - 1e-9);
        }
    }
}
