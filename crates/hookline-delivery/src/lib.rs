//! Reliable webhook delivery engine.
//!
//! Fans incoming events out to matching subscriptions, signs each payload
//! with the subscription secret, and POSTs it to the subscriber with
//! bounded exponential-backoff retries. Every attempt is recorded before
//! the delivery state moves, so the store always explains what happened.
//!
//! # Architecture
//!
//! 1. **Match** - `ingest_event` selects active subscriptions whose patterns
//!    cover the event type and creates one pending delivery per match
//! 2. **Dispatch** - fresh deliveries go on a bounded queue drained by a
//!    fixed worker set; retries travel on a second, independent queue
//! 3. **Attempt** - a worker signs and sends the request, stores the
//!    attempt, then applies the lifecycle transition
//! 4. **Sweep** - a ticker re-enqueues due retries and stranded pending
//!    rows; another deletes old terminal records
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::{EventId, RealClock};
//! use hookline_delivery::{storage::memory::InMemoryStorage, DeliveryConfig, DeliveryEngine};
//!
//! # async fn example() -> hookline_delivery::Result<()> {
//! let store = Arc::new(InMemoryStorage::new());
//! let mut engine =
//!     DeliveryEngine::new(DeliveryConfig::default(), store.clone(), store, Arc::new(RealClock::new()))?;
//!
//! engine.start()?;
//! engine.ingest_event(EventId::new(), "blog.post.created", r#"{"id":1}"#).await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod signing;
pub mod storage;
pub mod worker;

pub use config::DeliveryConfig;
pub use engine::{DeliveryEngine, IngestReport};
pub use error::{DeliveryError, EnqueueError, ErrorCategory, Result};
pub use pool::{PoolStats, QueueKind};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::SweepReport;
pub use storage::{DeliveryStorage, SubscriptionStorage};

/// Default number of workers on the fresh queue.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default capacity of each dispatch queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
