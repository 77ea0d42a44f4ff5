//! Periodic sweeps and the ticker that drives them.
//!
//! A [`Ticker`] owns one background task that runs a [`Sweep`] every
//! interval until stopped. Sweeps are also callable directly, which is how
//! tests drive them under a manually advanced clock.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{Clock, Delivery, DeliveryStatus, Subscription, SubscriptionId};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{EnqueueError, Result},
    pool::DispatchPool,
    storage::{DeliveryStorage, SubscriptionStorage},
};

/// Work run on every tick.
pub trait Sweep: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one pass. Failures are logged by the implementation.
    fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Owned periodic timer with an explicit start/stop lifecycle.
pub struct Ticker {
    interval: Duration,
    sweep: Arc<dyn Sweep>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Ticker {
    /// Creates a stopped ticker.
    pub fn new(interval: Duration, sweep: Arc<dyn Sweep>) -> Self {
        Self { interval, sweep, running: None }
    }

    /// Spawns the tick loop. The first sweep runs one interval after start.
    /// Calling it on a running ticker is a no-op.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let sweep = self.sweep.clone();
        let period = self.interval;
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(sweep = sweep.name(), interval_ms = period.as_millis(), "ticker started");

            loop {
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    _ = interval.tick() => sweep.run().await,
                }
            }

            debug!(sweep = sweep.name(), "ticker stopped");
        });

        self.running = Some((token, handle));
    }

    /// Stops the tick loop, letting a sweep already in progress finish.
    pub async fn stop(&mut self) {
        if let Some((token, handle)) = self.running.take() {
            token.cancel();
            if let Err(e) = handle.await {
                error!(sweep = self.sweep.name(), error = %e, "ticker task panicked");
            }
        }
    }

    /// Whether the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows returned by the due-retry and stranded queries.
    pub scanned: usize,
    /// Rows placed on the retry queue.
    pub enqueued: usize,
    /// Rows left for the next tick because the retry queue was full.
    pub skipped_full: usize,
    /// Stranded rows that already used every allowed attempt.
    pub skipped_max_retries: usize,
    /// Rows whose subscription is missing or inactive.
    pub skipped_missing_subscription: usize,
    /// Rows already queued, being attempted, or quarantined.
    pub already_queued: usize,
}

/// Re-enqueues due retries and stranded pending deliveries.
pub struct RetrySweeper {
    deliveries: Arc<dyn DeliveryStorage>,
    subscriptions: Arc<dyn SubscriptionStorage>,
    pool: Arc<DispatchPool>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    stranded_after: Duration,
    max_retries: u32,
}

impl RetrySweeper {
    /// Creates a sweeper feeding `pool`'s retry queue.
    pub fn new(
        deliveries: Arc<dyn DeliveryStorage>,
        subscriptions: Arc<dyn SubscriptionStorage>,
        pool: Arc<DispatchPool>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        stranded_after: Duration,
        max_retries: u32,
    ) -> Self {
        Self { deliveries, subscriptions, pool, clock, batch_size, stranded_after, max_retries }
    }

    /// Runs one sweep now.
    ///
    /// Each pass offers at most `batch_size` due retries and `batch_size`
    /// pending rows; anything beyond that waits for the next tick. Rows the
    /// pool has quarantined stay due in the store forever, so the queries
    /// over-fetch by the quarantine size and drop them before paging.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if either query fails. Rows enqueued
    /// before the failure stay enqueued.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let now = self.clock.now_utc();
        let mut report = SweepReport::default();
        let mut subscriptions = HashMap::new();

        let quarantined = self.pool.quarantined();
        let fetch = self.batch_size.saturating_add(quarantined.len());
        let unquarantined = |rows: Vec<Delivery>| -> Vec<Delivery> {
            rows.into_iter()
                .filter(|d| !quarantined.contains(&d.id))
                .take(self.batch_size)
                .collect()
        };

        let due = unquarantined(self.deliveries.list_due_retries(now, fetch).await?);
        report.scanned += due.len();
        for delivery in &due {
            self.offer(delivery, &mut subscriptions, &mut report).await?;
        }

        let cutoff = chrono::Duration::from_std(self.stranded_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pending =
            unquarantined(self.deliveries.list_by_status(DeliveryStatus::Pending, fetch).await?);
        for delivery in pending.iter().filter(|d| d.created_at <= cutoff) {
            report.scanned += 1;
            if delivery.attempt_count >= self.max_retries {
                report.skipped_max_retries += 1;
                warn!(
                    delivery_id = %delivery.id,
                    attempt_count = delivery.attempt_count,
                    "stranded delivery already reached max retries, skipping"
                );
                continue;
            }
            self.offer(delivery, &mut subscriptions, &mut report).await?;
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                enqueued = report.enqueued,
                skipped_full = report.skipped_full,
                skipped_max_retries = report.skipped_max_retries,
                skipped_missing_subscription = report.skipped_missing_subscription,
                already_queued = report.already_queued,
                "retry sweep completed"
            );
        }
        Ok(report)
    }

    async fn offer(
        &self,
        delivery: &Delivery,
        cache: &mut HashMap<SubscriptionId, Option<Subscription>>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let subscription = match cache.get(&delivery.subscription_id) {
            Some(cached) => cached.clone(),
            None => {
                let found = self
                    .subscriptions
                    .find_subscription(delivery.subscription_id)
                    .await?
                    .filter(|s| s.active);
                cache.insert(delivery.subscription_id, found.clone());
                found
            },
        };

        let Some(subscription) = subscription else {
            report.skipped_missing_subscription += 1;
            warn!(
                delivery_id = %delivery.id,
                subscription_id = %delivery.subscription_id,
                "subscription missing or inactive, delivery skipped"
            );
            return Ok(());
        };

        match self.pool.enqueue_retry(delivery, subscription) {
            Ok(()) => report.enqueued += 1,
            Err(EnqueueError::QueueFull { .. }) => report.skipped_full += 1,
            Err(EnqueueError::AlreadyQueued { .. } | EnqueueError::Quarantined { .. }) => {
                report.already_queued += 1;
            },
            Err(EnqueueError::ShuttingDown) => {
                debug!(delivery_id = %delivery.id, "pool shutting down, sweep item left for next run");
            },
        }
        Ok(())
    }
}

impl Sweep for RetrySweeper {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.sweep_now().await {
                error!(error = %e, "retry sweep failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use hookline_core::{DeliveryId, EventId, TestClock};
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        client::DeliveryClient,
        pool::PoolConfig,
        retry::RetryPolicy,
        storage::memory::InMemoryStorage,
        worker::DeliveryWorker,
    };

    struct CountingSweep(Arc<AtomicUsize>);

    impl Sweep for CountingSweep {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_runs_once_per_interval_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut ticker = Ticker::new(Duration::from_secs(10), Arc::new(CountingSweep(count.clone())));

        ticker.start();
        assert!(ticker.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        ticker.stop().await;
        assert!(!ticker.is_running());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_start_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut ticker = Ticker::new(Duration::from_secs(10), Arc::new(CountingSweep(count.clone())));

        ticker.start();
        ticker.start();
        tokio::time::sleep(Duration::from_secs(15)).await;
        ticker.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    async fn retrying(
        store: &InMemoryStorage,
        subscription: &Subscription,
        due: DateTime<Utc>,
    ) -> DeliveryId {
        let created_at = due - chrono::Duration::hours(1);
        let mut delivery = Delivery::new(subscription.id, EventId::new(), "a.b", "{}", created_at);
        delivery.status = DeliveryStatus::Retrying;
        delivery.attempt_count = 1;
        delivery.next_retry_at = Some(due);
        let id = delivery.id;
        store.create_delivery(delivery).await.unwrap();
        id
    }

    #[tokio::test]
    async fn quarantined_rows_do_not_fill_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = TestClock::at(now);
        let store = InMemoryStorage::new();
        let subscription = Subscription::new(server.uri(), "s", ["*"], now);
        store.insert_subscription(subscription.clone()).await.unwrap();

        // The quarantined row is the oldest due retry, so it heads every page
        let stuck = retrying(&store, &subscription, now - chrono::Duration::minutes(2)).await;
        let waiting = retrying(&store, &subscription, now - chrono::Duration::minutes(1)).await;

        let worker = DeliveryWorker::new(
            Arc::new(store.clone()),
            DeliveryClient::with_defaults().unwrap(),
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        );
        let pool = Arc::new(DispatchPool::new(
            PoolConfig { fresh_workers: 1, retry_workers: 1, queue_capacity: 4 },
            worker,
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
        ));
        pool.start();

        store.fail_next_update("disk full").await;
        let stuck_row = store.find_delivery(stuck).await.unwrap().unwrap();
        pool.enqueue_retry(&stuck_row, subscription.clone()).unwrap();
        for _ in 0..500 {
            if pool.stats().quarantined == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.quarantined().contains(&stuck));

        let sweeper = RetrySweeper::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            pool.clone(),
            Arc::new(clock.clone()),
            1,
            Duration::from_secs(300),
            5,
        );
        let report = sweeper.sweep_now().await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.already_queued, 0);
        assert!(!pool.quarantined().contains(&waiting));

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
