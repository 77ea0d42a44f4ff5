//! Error types for webhook delivery operations.
//!
//! Separates the failures of one delivery attempt (transport, HTTP status)
//! from failures of the engine around it (persistence, configuration,
//! shutdown) and from queue admission ([`EnqueueError`]), which is
//! backpressure rather than a delivery failure.

use std::fmt;

use hookline_core::{CoreError, DeliveryId};
use thiserror::Error;

use crate::pool::QueueKind;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Subscriber answered with a non-2xx status.
    #[error("HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Record store operation failed.
    ///
    /// The attempt that hit it is abandoned; the engine never retries it.
    #[error("persistence error: {message}")]
    Persistence {
        /// Store error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Engine shutdown requested.
    #[error("delivery engine shutting down")]
    ShutdownRequested,

    /// Workers did not finish their current attempt in time.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: std::time::Duration,
    },

    /// A lifecycle rule rejected the state change.
    #[error("invalid transition: {message}")]
    InvalidTransition {
        /// Rejected transition description
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an HTTP status error from a response.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a later attempt might succeed.
    ///
    /// Transport failures and non-2xx responses are retryable. Everything
    /// else is a fault of the engine or its inputs and is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::HttpStatus { .. } => true,

            Self::Persistence { .. }
            | Self::Configuration { .. }
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::InvalidTransition { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// HTTP status carried by the error, or 0 when no response arrived.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::HttpStatus { status_code, .. } => *status_code,
            _ => 0,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidTransition { .. } => {
                Self::InvalidTransition { message: error.to_string() }
            },
            other => Self::Persistence { message: other.to_string() },
        }
    }
}

/// Category of delivery error for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// Non-2xx responses.
    Http,
    /// Record store failures.
    Persistence,
    /// Configuration problems.
    Configuration,
    /// Lifecycle rule violations.
    Lifecycle,
    /// Shutdown and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::Persistence { .. } => Self::Persistence,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::InvalidTransition { .. } => Self::Lifecycle,
            DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Http => write!(f, "http"),
            Self::Persistence => write!(f, "persistence"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Reasons a delivery could not be admitted to a dispatch queue.
///
/// None of these change the persisted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The bounded queue is at capacity.
    #[error("{queue} queue is full")]
    QueueFull {
        /// Queue that rejected the delivery
        queue: QueueKind,
    },

    /// The pool stopped accepting work.
    #[error("dispatch pool is shutting down")]
    ShuttingDown,

    /// The delivery is already queued or held by a worker.
    #[error("delivery {delivery_id} is already queued")]
    AlreadyQueued {
        /// Delivery that was offered twice
        delivery_id: DeliveryId,
    },

    /// A previous attempt hit a persistence failure; the record's true state
    /// is unknown and it is held back for an operator.
    #[error("delivery {delivery_id} is quarantined after a persistence failure")]
    Quarantined {
        /// Delivery held back from dispatch
        delivery_id: DeliveryId,
    },
}
