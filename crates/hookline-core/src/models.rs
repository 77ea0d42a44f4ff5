//! Core domain models and strongly-typed identifiers.
//!
//! Defines subscriptions, deliveries, delivery attempts, and newtype ID
//! wrappers for compile-time type safety. State transition rules live in
//! [`crate::lifecycle`].

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed subscription identifier.
    ///
    /// A subscription is a registered subscriber endpoint; the ID follows it
    /// through every delivery made on its behalf.
    SubscriptionId
);

uuid_id!(
    /// Strongly-typed delivery identifier.
    ///
    /// One delivery exists per `(subscription, event)` pair.
    DeliveryId
);

uuid_id!(
    /// Strongly-typed delivery attempt identifier.
    AttemptId
);

uuid_id!(
    /// Identifier of the internal event being fanned out.
    ///
    /// Assigned by the event source; the engine only carries it through to
    /// deliveries and request headers.
    EventId
);

/// A registered subscriber endpoint.
///
/// Subscriptions are owned by an external store. The delivery engine reads
/// them and reports per-attempt statistics back through the store's atomic
/// counter update; it never writes the counters itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier for this subscription.
    pub id: SubscriptionId,

    /// Subscriber endpoint receiving POST requests.
    ///
    /// Unique across subscriptions.
    pub target_url: String,

    /// Shared key used to sign payloads with HMAC-SHA256.
    pub secret: String,

    /// Event type patterns: exact types, or prefixes ending in `*`.
    ///
    /// An empty list matches no events.
    #[serde(default)]
    pub event_types: Vec<String>,

    /// Inactive subscriptions receive nothing.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Total delivery attempts made to this subscription.
    #[serde(default)]
    pub total_deliveries: u64,

    /// Attempts answered with a 2xx status.
    #[serde(default)]
    pub successful_deliveries: u64,

    /// Attempts that failed with a transport error or non-2xx status.
    #[serde(default)]
    pub failed_deliveries: u64,

    /// When the most recent attempt finished.
    #[serde(default)]
    pub last_delivery_at: Option<DateTime<Utc>>,

    /// When the most recent successful attempt finished.
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,

    /// When the most recent failed attempt finished.
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,

    /// When this subscription was registered.
    pub created_at: DateTime<Utc>,

    /// When this subscription was last modified.
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Subscription {
    /// Creates an active subscription with zeroed statistics.
    pub fn new<I, S>(
        target_url: impl Into<String>,
        secret: impl Into<String>,
        event_types: I,
        now: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: SubscriptionId::new(),
            target_url: target_url.into(),
            secret: secret.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            active: true,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_delivery_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a copy with the active flag cleared.
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Delivery lifecycle status.
///
/// ```text
/// Pending --ok--> Success
///    |  \--fail, attempts exhausted--> Failed
///    \--fail--> Retrying --ok--> Success
///                  |  ^
///                  \--/ fail, attempts left
///                  \--fail, attempts exhausted--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created and waiting for its first attempt.
    Pending,

    /// At least one attempt failed; the next one is due at `next_retry_at`.
    Retrying,

    /// Subscriber answered with a 2xx status. Terminal.
    Success,

    /// Every allowed attempt failed. Terminal.
    Failed,
}

impl DeliveryStatus {
    /// Terminal states accept no further attempts or field changes.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Every allowed move corresponds to exactly one recorded attempt.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Retrying, Self::Success | Self::Retrying | Self::Failed)
        )
    }

    /// Stable lowercase name used in storage and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid delivery status: {other}"))),
        }
    }
}

/// One at-least-once delivery obligation for a single subscription and event.
///
/// Created `pending` when a matching event arrives and mutated only through
/// [`Delivery::apply_attempt`](crate::lifecycle) after each attempt. Removed
/// only by the retention sweep once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,

    /// Subscription this delivery targets.
    pub subscription_id: SubscriptionId,

    /// Event being delivered.
    pub event_id: EventId,

    /// Type of the event, used for routing and the `X-Webhook-Event` header.
    pub event_type: String,

    /// Raw event payload. Never modified after creation.
    pub event_payload: Bytes,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Number of attempts made so far. Never decreases.
    pub attempt_count: u32,

    /// When the next attempt is due. Only set while `Retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the most recent attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Failure message from the most recent failed attempt.
    pub last_error: Option<String>,

    /// When the delivery was created.
    pub created_at: DateTime<Utc>,

    /// When the delivery was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery with no attempts.
    pub fn new(
        subscription_id: SubscriptionId,
        event_id: EventId,
        event_type: impl Into<String>,
        event_payload: impl Into<Bytes>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            event_id,
            event_type: event_type.into(),
            event_payload: event_payload.into(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            last_attempt_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number the next attempt will carry (1-based).
    pub fn next_attempt_number(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }

    /// Whether a retrying delivery has reached its scheduled time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Retrying && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Immutable audit record of one HTTP call made for a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: AttemptId,

    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,

    /// 1-based sequence number; equals the delivery's attempt count after
    /// the call.
    pub attempt_number: u32,

    /// URL the request was sent to.
    pub request_url: String,

    /// HTTP status received, or 0 when no response arrived.
    pub response_status: u16,

    /// Response body, truncated for audit storage.
    pub response_body: String,

    /// Whether the subscriber answered with a 2xx status.
    pub success: bool,

    /// Failure summary. `None` on success.
    pub error: Option<String>,

    /// Wall time spent on the request in milliseconds.
    pub duration_ms: u64,

    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}
