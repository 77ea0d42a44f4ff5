//! Delivery state machine.
//!
//! A delivery changes state only by recording an attempt. Each call to
//! [`Delivery::apply_attempt`] corresponds to one appended
//! [`DeliveryAttempt`](crate::models::DeliveryAttempt) and moves the record
//! to `success`, `retrying` or `failed`.

use chrono::{DateTime, Utc};

use crate::{
    error::{CoreError, Result},
    models::{Delivery, DeliveryStatus},
};

/// Result of one HTTP attempt as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Subscriber answered with a 2xx status.
    Succeeded,
    /// Transport error or non-2xx status.
    Failed {
        /// Human-readable failure summary stored as `last_error`.
        error: String,
    },
}

impl AttemptOutcome {
    /// Convenience constructor for a failed outcome.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed { error: error.into() }
    }

    /// Whether the attempt succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// State change produced by applying an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Delivery reached `success`.
    Succeeded,
    /// Delivery is `retrying` and due again at `next_retry_at`.
    Rescheduled {
        /// When the next attempt becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// Every allowed attempt failed; delivery is `failed`.
    Exhausted,
}

impl Transition {
    /// Status the delivery holds after this transition.
    pub const fn status(self) -> DeliveryStatus {
        match self {
            Self::Succeeded => DeliveryStatus::Success,
            Self::Rescheduled { .. } => DeliveryStatus::Retrying,
            Self::Exhausted => DeliveryStatus::Failed,
        }
    }
}

impl Delivery {
    /// Records the outcome of one attempt and moves the delivery to its next
    /// state.
    ///
    /// `schedule` receives the attempt count after this failure and returns
    /// the due time of the next attempt; it is only called when attempts
    /// remain. Due times earlier than `now` are clamped to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransition`] if the delivery is already
    /// terminal. The record is left unchanged in that case.
    pub fn apply_attempt<F>(
        &mut self,
        outcome: &AttemptOutcome,
        max_retries: u32,
        now: DateTime<Utc>,
        schedule: F,
    ) -> Result<Transition>
    where
        F: FnOnce(u32) -> DateTime<Utc>,
    {
        if self.status.is_terminal() {
            let to = match outcome {
                AttemptOutcome::Succeeded => DeliveryStatus::Success,
                AttemptOutcome::Failed { .. } => DeliveryStatus::Retrying,
            };
            return Err(CoreError::InvalidTransition { delivery_id: self.id, from: self.status, to });
        }

        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.updated_at = now;

        let transition = match outcome {
            AttemptOutcome::Succeeded => {
                self.last_error = None;
                self.next_retry_at = None;
                Transition::Succeeded
            },
            AttemptOutcome::Failed { error } => {
                self.last_error = Some(error.clone());
                if self.attempt_count >= max_retries {
                    self.next_retry_at = None;
                    Transition::Exhausted
                } else {
                    let next_retry_at = schedule(self.attempt_count).max(now);
                    self.next_retry_at = Some(next_retry_at);
                    Transition::Rescheduled { next_retry_at }
                }
            },
        };

        self.status = transition.status();
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::{EventId, SubscriptionId};

    fn pending(now: DateTime<Utc>) -> Delivery {
        Delivery::new(SubscriptionId::new(), EventId::new(), "order.created", "{}", now)
    }

    fn one_minute_later(now: DateTime<Utc>) -> impl FnOnce(u32) -> DateTime<Utc> {
        move |_| now + Duration::minutes(1)
    }

    #[test]
    fn success_from_pending_is_terminal() {
        let now = Utc::now();
        let mut delivery = pending(now);

        let transition =
            delivery.apply_attempt(&AttemptOutcome::Succeeded, 3, now, one_minute_later(now)).unwrap();

        assert_eq!(transition, Transition::Succeeded);
        assert_eq!(delivery.status, DeliveryStatus::Success);
        assert_eq!(delivery.attempt_count, 1);
        assert_eq!(delivery.last_attempt_at, Some(now));
        assert!(delivery.next_retry_at.is_none());
    }

    #[test]
    fn failure_with_attempts_left_reschedules() {
        let now = Utc::now();
        let mut delivery = pending(now);

        let transition = delivery
            .apply_attempt(&AttemptOutcome::failed("HTTP 500"), 3, now, one_minute_later(now))
            .unwrap();

        assert_eq!(transition, Transition::Rescheduled { next_retry_at: now + Duration::minutes(1) });
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.last_error.as_deref(), Some("HTTP 500"));
        assert!(delivery.is_due(now + Duration::minutes(1)));
    }

    #[test]
    fn failure_at_max_retries_exhausts() {
        let now = Utc::now();
        let mut delivery = pending(now);

        for _ in 0..2 {
            delivery
                .apply_attempt(&AttemptOutcome::failed("HTTP 500"), 3, now, one_minute_later(now))
                .unwrap();
        }
        let transition = delivery
            .apply_attempt(&AttemptOutcome::failed("HTTP 500"), 3, now, |_| {
                panic!("must not schedule an exhausted delivery")
            })
            .unwrap();

        assert_eq!(transition, Transition::Exhausted);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempt_count, 3);
        assert!(delivery.next_retry_at.is_none());
    }

    #[test]
    fn success_after_retry_clears_error() {
        let now = Utc::now();
        let mut delivery = pending(now);

        delivery
            .apply_attempt(&AttemptOutcome::failed("timeout"), 3, now, one_minute_later(now))
            .unwrap();
        delivery.apply_attempt(&AttemptOutcome::Succeeded, 3, now, one_minute_later(now)).unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Success);
        assert_eq!(delivery.attempt_count, 2);
        assert!(delivery.last_error.is_none());
    }

    #[test]
    fn terminal_delivery_rejects_attempts_unchanged() {
        let now = Utc::now();
        let mut delivery = pending(now);
        delivery.apply_attempt(&AttemptOutcome::Succeeded, 3, now, one_minute_later(now)).unwrap();
        let before = delivery.clone();

        let error = delivery
            .apply_attempt(&AttemptOutcome::failed("late"), 3, now, one_minute_later(now))
            .unwrap_err();

        assert!(matches!(error, CoreError::InvalidTransition { from: DeliveryStatus::Success, .. }));
        assert_eq!(delivery, before);
    }

    #[test]
    fn past_due_time_clamped_to_now() {
        let now = Utc::now();
        let mut delivery = pending(now);

        delivery
            .apply_attempt(&AttemptOutcome::failed("HTTP 503"), 5, now, |_| now - Duration::hours(1))
            .unwrap();

        assert_eq!(delivery.next_retry_at, Some(now));
    }

    #[test]
    fn schedule_receives_attempt_count_after_failure() {
        let now = Utc::now();
        let mut delivery = pending(now);
        delivery.attempt_count = 2;
        delivery.status = DeliveryStatus::Retrying;

        let mut seen = 0;
        delivery
            .apply_attempt(&AttemptOutcome::failed("HTTP 502"), 5, now, |n| {
                seen = n;
                now
            })
            .unwrap();

        assert_eq!(seen, 3);
    }
}
