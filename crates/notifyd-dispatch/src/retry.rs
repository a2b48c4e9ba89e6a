//! Exponential backoff with jitter for failed deliveries.
//!
//! `backoff(k) = min(base * 2^k, max)` where `k` is the pre-increment
//! attempt count, so the first retry waits `base`, the second `2 * base`,
//! and so on. Additive jitter drawn uniformly from one tenth of the delay
//! in either direction spreads retries of tasks that failed together.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry timing policy for failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the exponential curve.
    pub base_backoff: Duration,

    /// Upper bound on any single delay, jitter included.
    pub max_backoff: Duration,

    /// Fraction of the capped delay used as the jitter half-width.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(24 * 60 * 60),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `prior_attempts` completed attempts.
    ///
    /// The exponent saturates and the result is clamped to `max_backoff`
    /// both before and after jitter, so the delay is bounded for any input.
    pub fn backoff(&self, prior_attempts: i32) -> Duration {
        let exponent = u32::try_from(prior_attempts).unwrap_or(0).min(30);
        let multiplier = 2_u32.saturating_pow(exponent);
        let raw = self.base_backoff.saturating_mul(multiplier);
        let capped = raw.min(self.max_backoff);

        apply_jitter(capped, self.jitter_factor).min(self.max_backoff)
    }

    /// Absolute due time for the next attempt.
    pub fn next_attempt_at(&self, prior_attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff(prior_attempts);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(24))
    }
}

/// Adds uniform jitter of `±(duration * factor)` to a delay.
fn apply_jitter(duration: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = factor.clamp(0.0, 1.0);
    let half_width = duration.as_secs_f64() * clamped;

    let mut rng = rand::rng();
    let offset = rng.random_range(-half_width..=half_width);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_jitter_policy(base_secs: u64) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_secs(base_secs),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = no_jitter_policy(5);

        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
    }

    #[test]
    fn backoff_capped_at_max() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            jitter_factor: 0.0,
        };

        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(1000), Duration::from_secs(60));
    }

    #[test]
    fn twenty_four_hour_default_cap() {
        let policy = RetryPolicy { jitter_factor: 0.0, ..Default::default() };

        // 5s * 2^20 is far past a day.
        assert_eq!(policy.backoff(20), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn negative_attempt_count_treated_as_zero() {
        let policy = no_jitter_policy(5);
        assert_eq!(policy.backoff(-3), Duration::from_secs(5));
    }

    #[test]
    fn jitter_varies_the_delay() {
        let base = Duration::from_secs(100);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..32 {
            seen.insert(apply_jitter(base, 0.1).as_millis());
        }

        assert!(seen.len() > 1, "jitter should produce variation");
    }

    #[test]
    fn next_attempt_at_is_in_the_future() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let due = policy.next_attempt_at(0, now);
        assert!(due > now);
    }

    proptest! {
        #[test]
        fn jitter_stays_within_band(secs in 1u64..86_400, factor in 0.0f64..1.0) {
            let base = Duration::from_secs(secs);
            let jittered = apply_jitter(base, factor);

            let half_width = base.as_secs_f64() * factor;
            let lo = (base.as_secs_f64() - half_width).max(0.0);
            let hi = base.as_secs_f64() + half_width;

            // Small epsilon absorbs float conversion at the band edges.
            prop_assert!(jittered.as_secs_f64() >= lo - 1e-6);
            prop_assert!(jittered.as_secs_f64() <= hi + 1e-6);
        }

        #[test]
        fn backoff_never_exceeds_cap(prior in 0i32..64, base in 1u64..3600) {
            let policy = RetryPolicy {
                base_backoff: Duration::from_secs(base),
                ..Default::default()
            };

            prop_assert!(policy.backoff(prior) <= policy.max_backoff);
        }
    }
}
