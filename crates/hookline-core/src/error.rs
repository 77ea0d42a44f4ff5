//! Error types for record storage and lifecycle operations.
//!
//! Collaborator stores report failures through `CoreError` so the delivery
//! engine can classify them as persistence errors without knowing the
//! backing technology.

use thiserror::Error;

use crate::models::{DeliveryId, DeliveryStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for record operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Backing store operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation such as a duplicate subscription URL.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lifecycle rule rejected the requested state change.
    #[error("invalid transition for delivery {delivery_id}: {from} -> {to}")]
    InvalidTransition {
        /// Delivery whose state change was rejected
        delivery_id: DeliveryId,
        /// Current status of the record
        from: DeliveryStatus,
        /// Requested status
        to: DeliveryStatus,
    },
}

impl CoreError {
    /// Returns true when the error originates from the backing store rather
    /// than from a rule violation.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
