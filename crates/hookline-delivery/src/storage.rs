//! Storage abstraction layer for the delivery engine.
//!
//! The durable record store and the subscription store are external
//! collaborators. The engine reaches them through the [`DeliveryStorage`]
//! and [`SubscriptionStorage`] traits; [`memory::InMemoryStorage`] is the
//! reference implementation used by tests and by the service binary.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use hookline_core::{
    error::Result, Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, Subscription,
    SubscriptionId,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Delivery and attempt persistence required by the engine.
///
/// Implementations must reject mutations of terminal deliveries and any
/// update that lowers `attempt_count`.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Persists a new delivery.
    fn create_delivery(&self, delivery: Delivery) -> StorageFuture<'_, ()>;

    /// Replaces the stored delivery with `delivery`.
    fn update_delivery(&self, delivery: Delivery) -> StorageFuture<'_, ()>;

    /// Appends an attempt to its delivery's audit trail.
    fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()>;

    /// Appends `attempt` and replaces the stored delivery with `delivery` in
    /// one atomic write. Either both rows change or neither does.
    ///
    /// `attempt.attempt_number` must be the stored `attempt_count + 1` and
    /// `delivery.attempt_count` must equal it.
    fn record_attempt(
        &self,
        attempt: DeliveryAttempt,
        delivery: Delivery,
    ) -> StorageFuture<'_, ()>;

    /// Finds a delivery by ID.
    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>>;

    /// Returns a delivery's attempts ordered by attempt number.
    fn find_attempts(&self, id: DeliveryId) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Returns up to `limit` deliveries in `status`, oldest first.
    fn list_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> StorageFuture<'_, Vec<Delivery>>;

    /// Returns up to `limit` retrying deliveries with `next_retry_at <= now`,
    /// earliest due first.
    fn list_due_retries(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<Delivery>>;

    /// Deletes terminal deliveries created before `cutoff`, together with
    /// their attempts. Returns the number of deliveries removed.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64>;
}

/// Read access to subscriptions plus the statistics update.
pub trait SubscriptionStorage: Send + Sync + 'static {
    /// Finds a subscription by ID, active or not.
    fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>>;

    /// Returns every active subscription.
    fn list_active_subscriptions(&self) -> StorageFuture<'_, Vec<Subscription>>;

    /// Records one attempt's outcome against the subscription's counters.
    ///
    /// Must be an atomic increment in the store, never a read-modify-write
    /// by the caller.
    fn update_subscription_statistics(
        &self,
        id: SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;
}

pub mod memory {
    //! In-memory record store.
    //!
    //! Enforces the same record invariants a durable store must: unique
    //! subscription URLs, append-only attempts, monotonic attempt counts and
    //! frozen terminal deliveries. Supports injecting write failures to
    //! exercise persistence error paths.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use hookline_core::{
        error::{CoreError, Result},
        Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, Subscription, SubscriptionId,
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture, SubscriptionStorage};

    #[derive(Debug, Default)]
    struct State {
        deliveries: HashMap<DeliveryId, Delivery>,
        attempts: HashMap<DeliveryId, Vec<DeliveryAttempt>>,
        subscriptions: HashMap<SubscriptionId, Subscription>,
        attempt_write_error: Option<String>,
        update_error: Option<String>,
    }

    /// In-memory implementation of both storage traits.
    ///
    /// Cloning yields a handle to the same data.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryStorage {
        state: Arc<RwLock<State>>,
    }

    impl InMemoryStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a subscription.
        ///
        /// # Errors
        ///
        /// Returns [`CoreError::ConstraintViolation`] if another subscription
        /// already uses the same target URL.
        pub async fn insert_subscription(&self, subscription: Subscription) -> Result<()> {
            let mut state = self.state.write().await;
            let duplicate = state.subscriptions.values().any(|existing| {
                existing.id != subscription.id && existing.target_url == subscription.target_url
            });
            if duplicate {
                return Err(CoreError::ConstraintViolation(format!(
                    "subscription target_url already registered: {}",
                    subscription.target_url
                )));
            }
            state.subscriptions.insert(subscription.id, subscription);
            Ok(())
        }

        /// Sets a subscription's active flag.
        pub async fn set_subscription_active(&self, id: SubscriptionId, active: bool) -> Result<()> {
            let mut state = self.state.write().await;
            let subscription = state
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))?;
            subscription.active = active;
            Ok(())
        }

        /// Number of stored deliveries.
        pub async fn delivery_count(&self) -> usize {
            self.state.read().await.deliveries.len()
        }

        /// All stored deliveries, oldest first.
        pub async fn deliveries(&self) -> Vec<Delivery> {
            let state = self.state.read().await;
            let mut deliveries: Vec<_> = state.deliveries.values().cloned().collect();
            deliveries.sort_by_key(|d| d.created_at);
            deliveries
        }

        /// Makes the next `create_attempt` or `record_attempt` call fail with a
        /// storage error.
        pub async fn fail_next_attempt_write(&self, message: impl Into<String>) {
            self.state.write().await.attempt_write_error = Some(message.into());
        }

        /// Makes the next `update_delivery` or `record_attempt` call fail with a
        /// storage error.
        pub async fn fail_next_update(&self, message: impl Into<String>) {
            self.state.write().await.update_error = Some(message.into());
        }
    }

    fn check_update(stored: &Delivery, delivery: &Delivery) -> Result<()> {
        if stored.status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                delivery_id: delivery.id,
                from: stored.status,
                to: delivery.status,
            });
        }
        if delivery.attempt_count < stored.attempt_count {
            return Err(CoreError::ConstraintViolation(format!(
                "attempt_count for delivery {} cannot decrease from {} to {}",
                delivery.id, stored.attempt_count, delivery.attempt_count
            )));
        }
        if delivery.event_payload != stored.event_payload {
            return Err(CoreError::ConstraintViolation(format!(
                "payload of delivery {} is immutable",
                delivery.id
            )));
        }
        Ok(())
    }

    fn check_attempt(
        delivery: &Delivery,
        existing: Option<&Vec<DeliveryAttempt>>,
        attempt: &DeliveryAttempt,
    ) -> Result<()> {
        if delivery.status.is_terminal() {
            return Err(CoreError::ConstraintViolation(format!(
                "delivery {} is {} and accepts no attempts",
                delivery.id, delivery.status
            )));
        }
        if existing.is_some_and(|a| a.iter().any(|a| a.attempt_number == attempt.attempt_number)) {
            return Err(CoreError::ConstraintViolation(format!(
                "attempt {} already recorded for delivery {}",
                attempt.attempt_number, attempt.delivery_id
            )));
        }
        Ok(())
    }

    impl DeliveryStorage for InMemoryStorage {
        fn create_delivery(&self, delivery: Delivery) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                if state.deliveries.contains_key(&delivery.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery {} already exists",
                        delivery.id
                    )));
                }
                state.deliveries.insert(delivery.id, delivery);
                Ok(())
            })
        }

        fn update_delivery(&self, delivery: Delivery) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                if let Some(message) = state.update_error.take() {
                    return Err(CoreError::Storage(message));
                }

                let stored = state
                    .deliveries
                    .get_mut(&delivery.id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {}", delivery.id)))?;
                check_update(stored, &delivery)?;

                *stored = delivery;
                Ok(())
            })
        }

        fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                if let Some(message) = state.attempt_write_error.take() {
                    return Err(CoreError::Storage(message));
                }

                let state = &mut *state;
                let delivery = state.deliveries.get(&attempt.delivery_id).ok_or_else(|| {
                    CoreError::NotFound(format!("delivery {}", attempt.delivery_id))
                })?;
                check_attempt(delivery, state.attempts.get(&delivery.id), &attempt)?;

                state.attempts.entry(attempt.delivery_id).or_default().push(attempt);
                Ok(())
            })
        }

        fn record_attempt(
            &self,
            attempt: DeliveryAttempt,
            delivery: Delivery,
        ) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut guard = state.write().await;
                let state = &mut *guard;
                if let Some(message) = state.attempt_write_error.take() {
                    return Err(CoreError::Storage(message));
                }
                if let Some(message) = state.update_error.take() {
                    return Err(CoreError::Storage(message));
                }

                if attempt.delivery_id != delivery.id {
                    return Err(CoreError::ConstraintViolation(format!(
                        "attempt for delivery {} recorded against delivery {}",
                        attempt.delivery_id, delivery.id
                    )));
                }
                let stored = state
                    .deliveries
                    .get(&delivery.id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {}", delivery.id)))?;
                check_update(stored, &delivery)?;
                check_attempt(stored, state.attempts.get(&delivery.id), &attempt)?;
                if attempt.attempt_number != stored.attempt_count + 1
                    || delivery.attempt_count != attempt.attempt_number
                {
                    return Err(CoreError::ConstraintViolation(format!(
                        "attempt {} does not follow attempt_count {} of delivery {}",
                        attempt.attempt_number, stored.attempt_count, delivery.id
                    )));
                }

                state.attempts.entry(delivery.id).or_default().push(attempt);
                state.deliveries.insert(delivery.id, delivery);
                Ok(())
            })
        }

        fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.read().await.deliveries.get(&id).cloned()) })
        }

        fn find_attempts(&self, id: DeliveryId) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut attempts = state.read().await.attempts.get(&id).cloned().unwrap_or_default();
                attempts.sort_by_key(|a| a.attempt_number);
                Ok(attempts)
            })
        }

        fn list_by_status(
            &self,
            status: DeliveryStatus,
            limit: usize,
        ) -> StorageFuture<'_, Vec<Delivery>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut matching: Vec<_> =
                    state.deliveries.values().filter(|d| d.status == status).cloned().collect();
                matching.sort_by_key(|d| d.created_at);
                matching.truncate(limit);
                Ok(matching)
            })
        }

        fn list_due_retries(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<Delivery>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut due: Vec<_> =
                    state.deliveries.values().filter(|d| d.is_due(now)).cloned().collect();
                due.sort_by_key(|d| d.next_retry_at);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let expired: Vec<DeliveryId> = state
                    .deliveries
                    .values()
                    .filter(|d| d.status.is_terminal() && d.created_at < cutoff)
                    .map(|d| d.id)
                    .collect();

                for id in &expired {
                    state.deliveries.remove(id);
                    state.attempts.remove(id);
                }
                Ok(expired.len() as u64)
            })
        }
    }

    impl SubscriptionStorage for InMemoryStorage {
        fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.read().await.subscriptions.get(&id).cloned()) })
        }

        fn list_active_subscriptions(&self) -> StorageFuture<'_, Vec<Subscription>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut active: Vec<_> =
                    state.subscriptions.values().filter(|s| s.active).cloned().collect();
                active.sort_by_key(|s| s.created_at);
                Ok(active)
            })
        }

        fn update_subscription_statistics(
            &self,
            id: SubscriptionId,
            success: bool,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let subscription = state
                    .subscriptions
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))?;

                subscription.total_deliveries += 1;
                subscription.last_delivery_at = Some(at);
                if success {
                    subscription.successful_deliveries += 1;
                    subscription.last_success_at = Some(at);
                } else {
                    subscription.failed_deliveries += 1;
                    subscription.last_failure_at = Some(at);
                }
                subscription.updated_at = at;
                Ok(())
            })
        }
    }
}
