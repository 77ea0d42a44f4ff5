//! Webhook delivery engine facade.
//!
//! Wires the subscription matcher, the dispatch pool, the retry and
//! retention sweeps, and the record store into one object with a
//! `start`/`shutdown` lifecycle.
//!
//! ```text
//! ingest_event ──▶ matcher ──▶ create pending ──▶ fresh queue ──┐
//!                                                               ▼
//!                    retry sweep ──▶ retry queue ──────▶ DeliveryWorker ──▶ subscriber
//!                         ▲                                     │
//!                         └──────── retrying rows ◀─────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;
use hookline_core::{Clock, Delivery, DeliveryAttempt, DeliveryId, EventId};
use tracing::{error, info, warn};

use crate::{
    cleanup::RetentionSweeper,
    client::DeliveryClient,
    config::DeliveryConfig,
    error::{DeliveryError, EnqueueError, Result},
    matcher::match_subscriptions,
    pool::{DispatchPool, PoolConfig, PoolStats},
    scheduler::{RetrySweeper, SweepReport, Ticker},
    storage::{DeliveryStorage, SubscriptionStorage},
    worker::DeliveryWorker,
};

/// Outcome of fanning out one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Active subscriptions whose patterns matched.
    pub matched: usize,
    /// Deliveries created and placed on the fresh queue.
    pub enqueued: usize,
    /// Deliveries created but rejected by a full fresh queue. They stay
    /// pending and are recovered by the stranded-delivery scan.
    pub queue_full: usize,
    /// Deliveries created while the pool was shutting down. They stay
    /// pending for the next run.
    pub deferred: usize,
    /// Matches whose delivery record could not be created.
    pub persistence_failures: usize,
    /// IDs of every delivery created, in match order.
    pub delivery_ids: Vec<DeliveryId>,
}

/// Main delivery engine coordinating workers and sweeps.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    deliveries: Arc<dyn DeliveryStorage>,
    subscriptions: Arc<dyn SubscriptionStorage>,
    clock: Arc<dyn Clock>,
    pool: Arc<DispatchPool>,
    retry_sweeper: Arc<RetrySweeper>,
    retention_sweeper: Arc<RetentionSweeper>,
    retry_ticker: Ticker,
    retention_ticker: Ticker,
}

impl DeliveryEngine {
    /// Creates a stopped engine.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid or the HTTP
    /// client cannot be built.
    pub fn new(
        config: DeliveryConfig,
        deliveries: Arc<dyn DeliveryStorage>,
        subscriptions: Arc<dyn SubscriptionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = DeliveryClient::new(config.client_config())?;
        let worker =
            DeliveryWorker::new(deliveries.clone(), client, config.retry_policy(), clock.clone());
        let pool = Arc::new(DispatchPool::new(
            PoolConfig {
                fresh_workers: config.worker_count,
                retry_workers: config.retry_worker_count(),
                queue_capacity: config.queue_capacity,
            },
            worker,
            subscriptions.clone(),
            clock.clone(),
        ));

        let retry_sweeper = Arc::new(RetrySweeper::new(
            deliveries.clone(),
            subscriptions.clone(),
            pool.clone(),
            clock.clone(),
            config.sweep_batch_size,
            config.stranded_after,
            config.max_retries,
        ));
        let retention_sweeper = Arc::new(RetentionSweeper::new(
            deliveries.clone(),
            clock.clone(),
            config.retention_window(),
        ));

        let retry_ticker = Ticker::new(config.retry_check_interval, retry_sweeper.clone());
        let retention_ticker =
            Ticker::new(config.retention_check_interval, retention_sweeper.clone());

        Ok(Self {
            config,
            deliveries,
            subscriptions,
            clock,
            pool,
            retry_sweeper,
            retention_sweeper,
            retry_ticker,
            retention_ticker,
        })
    }

    /// Starts the dispatch workers and both sweep tickers.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` if the engine was already shut down.
    pub fn start(&mut self) -> Result<()> {
        if !self.pool.is_accepting() {
            return Err(DeliveryError::ShutdownRequested);
        }

        info!(
            worker_count = self.config.worker_count,
            retry_worker_count = self.config.retry_worker_count(),
            queue_capacity = self.config.queue_capacity,
            max_retries = self.config.max_retries,
            "starting webhook delivery engine"
        );

        self.pool.start();
        self.retry_ticker.start();
        self.retention_ticker.start();

        info!("delivery engine started");
        Ok(())
    }

    /// Fans an event out to every matching active subscription.
    ///
    /// Creates one pending delivery per match and offers it to the fresh
    /// queue. Never waits for a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` after shutdown began, or a persistence
    /// error if the active subscriptions cannot be listed. Per-match
    /// failures are counted in the report instead.
    pub async fn ingest_event(
        &self,
        event_id: EventId,
        event_type: &str,
        payload: impl Into<Bytes>,
    ) -> Result<IngestReport> {
        if !self.pool.is_accepting() {
            return Err(DeliveryError::ShutdownRequested);
        }

        let payload = payload.into();
        let active = self.subscriptions.list_active_subscriptions().await?;
        let matched = match_subscriptions(event_type, &active);
        let mut report = IngestReport { matched: matched.len(), ..IngestReport::default() };

        for subscription in matched {
            let delivery = Delivery::new(
                subscription.id,
                event_id,
                event_type,
                payload.clone(),
                self.clock.now_utc(),
            );

            if let Err(e) = self.deliveries.create_delivery(delivery.clone()).await {
                report.persistence_failures += 1;
                error!(
                    event_id = %event_id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "failed to create delivery record"
                );
                continue;
            }
            report.delivery_ids.push(delivery.id);

            match self.pool.enqueue_fresh(&delivery, subscription.clone()) {
                Ok(()) => report.enqueued += 1,
                Err(EnqueueError::QueueFull { .. }) => report.queue_full += 1,
                Err(EnqueueError::ShuttingDown) => report.deferred += 1,
                Err(e @ (EnqueueError::AlreadyQueued { .. } | EnqueueError::Quarantined { .. })) => {
                    // A brand-new ID cannot be tracked yet
                    return Err(DeliveryError::internal(e.to_string()));
                },
            }
        }

        if report.queue_full > 0 {
            warn!(
                event_id = %event_id,
                event_type,
                queue_full = report.queue_full,
                "fresh queue full, deliveries left pending for recovery"
            );
        }
        info!(
            event_id = %event_id,
            event_type,
            matched = report.matched,
            enqueued = report.enqueued,
            "event ingested"
        );
        Ok(report)
    }

    /// Current state of a delivery.
    pub async fn delivery(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        Ok(self.deliveries.find_delivery(id).await?)
    }

    /// Attempt history of a delivery, oldest first.
    pub async fn attempts(&self, id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.deliveries.find_attempts(id).await?)
    }

    /// Runs the retry sweep immediately.
    pub async fn sweep_retries(&self) -> Result<SweepReport> {
        self.retry_sweeper.sweep_now().await
    }

    /// Runs the retention sweep immediately.
    pub async fn sweep_retention(&self) -> Result<u64> {
        self.retention_sweeper.sweep_now().await
    }

    /// Dispatch pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stops both tickers, then drains the dispatch pool.
    ///
    /// Enqueues are rejected from the moment this is called. Each worker
    /// finishes the attempt it is making, bounded by `shutdown_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish in time.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down delivery engine");

        self.retry_ticker.stop().await;
        self.retention_ticker.stop().await;
        self.pool.shutdown(self.config.shutdown_timeout).await?;

        info!("delivery engine stopped");
        Ok(())
    }
}
