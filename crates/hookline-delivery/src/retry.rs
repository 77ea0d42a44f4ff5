//! Exponential backoff for failed deliveries.
//!
//! After the n-th failed attempt the next one is due
//! `initial_delay × 2^(n−1)` later, capped at `max_delay`. No jitter is
//! applied, so schedules are reproducible under a test clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry policy applied to every delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_retries: u32,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at the given time.
    Retry {
        /// When the next delivery attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop; the delivery is exhausted.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryPolicy {
    /// Delay before the attempt following failure number `attempt_count`.
    ///
    /// `attempt_count` is the count after the failure, so the first failure
    /// passes 1. Values of 0 are treated as 1.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Due time of the next attempt after failure number `attempt_count`.
    pub fn compute_next_retry(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for(attempt_count))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Decides between another attempt and giving up.
    pub fn decide(&self, attempt_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempt_count >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_retries),
            };
        }
        RetryDecision::Retry { next_attempt_at: self.compute_next_retry(attempt_count, now) }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn default_schedule_doubles_from_one_minute() {
        let policy = RetryPolicy::default();
        let now = now();

        assert_eq!(policy.compute_next_retry(1, now), now + chrono::Duration::minutes(1));
        assert_eq!(policy.compute_next_retry(2, now), now + chrono::Duration::minutes(2));
        assert_eq!(policy.compute_next_retry(3, now), now + chrono::Duration::minutes(4));
        assert_eq!(policy.compute_next_retry(4, now), now + chrono::Duration::minutes(8));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_retries: 20,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
        };

        assert_eq!(policy.delay_for(4), Duration::from_secs(480));
        assert_eq!(policy.delay_for(5), Duration::from_secs(600));
        assert_eq!(policy.delay_for(12), Duration::from_secs(600));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy { max_delay: Duration::MAX, ..RetryPolicy::default() };

        assert!(policy.delay_for(u32::MAX) >= Duration::from_secs(60));
        assert!(policy.compute_next_retry(u32::MAX, now()) > now());
    }

    #[test]
    fn zero_treated_as_first_failure() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), policy.delay_for(1));
    }

    #[test]
    fn gives_up_at_max_retries() {
        let policy = RetryPolicy { max_retries: 3, ..RetryPolicy::default() };

        assert!(matches!(policy.decide(2, now()), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(3, now()), RetryDecision::GiveUp { .. }));
    }
}
