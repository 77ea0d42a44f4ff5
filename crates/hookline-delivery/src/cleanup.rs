//! Retention sweep for terminal delivery records.

use std::{future::Future, pin::Pin, sync::Arc};

use hookline_core::Clock;
use tracing::{error, info};

use crate::{error::Result, scheduler::Sweep, storage::DeliveryStorage};

/// Deletes terminal deliveries, and their attempts, past the retention
/// window. Pending and retrying rows are never touched.
pub struct RetentionSweeper {
    deliveries: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    /// Creates a sweeper keeping records for `retention`.
    pub fn new(
        deliveries: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        retention: chrono::Duration,
    ) -> Self {
        Self { deliveries, clock, retention }
    }

    /// Runs one retention pass and returns the number of deliveries deleted.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the store rejects the delete.
    pub async fn sweep_now(&self) -> Result<u64> {
        let now = self.clock.now_utc();
        let cutoff = now.checked_sub_signed(self.retention).unwrap_or(now);
        let deleted = self.deliveries.delete_older_than(cutoff).await?;

        info!(deleted, cutoff = %cutoff, "retention sweep completed");
        Ok(deleted)
    }
}

impl Sweep for RetentionSweeper {
    fn name(&self) -> &'static str {
        "retention"
    }

    fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.sweep_now().await {
                error!(error = %e, "retention sweep failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use hookline_core::{Delivery, DeliveryStatus, EventId, SubscriptionId, TestClock};

    use super::*;
    use crate::storage::memory::InMemoryStorage;

    #[tokio::test]
    async fn deletes_terminal_rows_once_past_window() {
        let store = InMemoryStorage::new();
        let clock = TestClock::new();
        let sweeper = RetentionSweeper::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            chrono::Duration::days(7),
        );

        let mut done =
            Delivery::new(SubscriptionId::new(), EventId::new(), "a", "{}", clock.now_utc());
        done.status = DeliveryStatus::Success;
        done.attempt_count = 1;
        store.create_delivery(done).await.unwrap();

        let mut retrying =
            Delivery::new(SubscriptionId::new(), EventId::new(), "a", "{}", clock.now_utc());
        retrying.status = DeliveryStatus::Retrying;
        retrying.next_retry_at = Some(Utc::now());
        store.create_delivery(retrying).await.unwrap();

        assert_eq!(sweeper.sweep_now().await.unwrap(), 0);

        clock.advance(Duration::from_secs(8 * 24 * 60 * 60));

        assert_eq!(sweeper.sweep_now().await.unwrap(), 1);
        assert_eq!(store.delivery_count().await, 1);
    }
}
