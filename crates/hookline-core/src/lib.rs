//! Core domain models and lifecycle rules.
//!
//! Provides strongly-typed identifiers, the subscription, delivery and
//! attempt records, the delivery state machine, and the clock abstraction
//! shared by every other hookline crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod lifecycle;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use lifecycle::{AttemptOutcome, Transition};
pub use models::{
    AttemptId, Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, EventId, Subscription,
    SubscriptionId,
};
pub use time::{Clock, RealClock, TestClock};
