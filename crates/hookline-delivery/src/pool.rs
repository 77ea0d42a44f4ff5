//! Bounded dispatch pool with separate fresh and retry queues.
//!
//! Fresh deliveries and retries travel on independent bounded channels,
//! each drained by its own fixed set of workers, so a backlog of retries
//! cannot starve new deliveries. Admission is non-blocking: a full queue
//! rejects the delivery with [`EnqueueError::QueueFull`] and the persisted
//! record stays as it was.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use hookline_core::{Clock, Delivery, DeliveryId, Subscription};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, EnqueueError, ErrorCategory, Result},
    storage::SubscriptionStorage,
    worker::DeliveryWorker,
};

/// Which of the two dispatch queues an item travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// First attempts of newly created deliveries.
    Fresh,
    /// Due retries and recovered stranded deliveries.
    Retry,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Sizing for the dispatch pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers on the fresh queue.
    pub fresh_workers: usize,
    /// Workers on the retry queue.
    pub retry_workers: usize,
    /// Capacity of each queue.
    pub queue_capacity: usize,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers currently running.
    pub active_workers: usize,
    /// Deliveries currently queued or held by a worker.
    pub in_flight: usize,
    /// Network attempts made.
    pub processed: u64,
    /// Attempts answered with 2xx.
    pub succeeded: u64,
    /// Attempts that failed on the network or with non-2xx.
    pub failed: u64,
    /// Enqueues rejected because a queue was full.
    pub rejected: u64,
    /// Attempts whose outcome could not be persisted.
    pub persistence_errors: u64,
    /// Deliveries held back after a persistence failure.
    pub quarantined: usize,
}

#[derive(Debug, Default)]
struct Counters {
    active_workers: AtomicUsize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    persistence_errors: AtomicU64,
}

struct Job {
    delivery_id: DeliveryId,
    subscription: Subscription,
}

/// Delivery IDs owned by the pool.
#[derive(Debug, Default)]
struct Tracking {
    /// Queued or being attempted.
    in_flight: HashSet<DeliveryId>,
    /// Hit a persistence failure; never dispatched again by this pool.
    quarantined: HashSet<DeliveryId>,
}

struct Shared {
    worker: DeliveryWorker,
    subscriptions: Arc<dyn SubscriptionStorage>,
    clock: Arc<dyn Clock>,
    tracking: Mutex<Tracking>,
    counters: Counters,
}

impl Shared {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed worker sets draining the fresh and retry queues.
pub struct DispatchPool {
    config: PoolConfig,
    shared: Arc<Shared>,
    fresh_tx: mpsc::Sender<Job>,
    retry_tx: mpsc::Sender<Job>,
    fresh_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    retry_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    accepting: AtomicBool,
    cancellation_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    /// Creates a pool with empty queues. No workers run until [`start`].
    ///
    /// [`start`]: DispatchPool::start
    pub fn new(
        config: PoolConfig,
        worker: DeliveryWorker,
        subscriptions: Arc<dyn SubscriptionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (fresh_tx, fresh_rx) = mpsc::channel(capacity);
        let (retry_tx, retry_rx) = mpsc::channel(capacity);

        Self {
            config,
            shared: Arc::new(Shared {
                worker,
                subscriptions,
                clock,
                tracking: Mutex::new(Tracking::default()),
                counters: Counters::default(),
            }),
            fresh_tx,
            retry_tx,
            fresh_rx: Arc::new(AsyncMutex::new(fresh_rx)),
            retry_rx: Arc::new(AsyncMutex::new(retry_rx)),
            accepting: AtomicBool::new(true),
            cancellation_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns both worker sets. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handles = self.worker_handles.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() || self.cancellation_token.is_cancelled() {
            return;
        }

        info!(
            fresh_workers = self.config.fresh_workers,
            retry_workers = self.config.retry_workers,
            queue_capacity = self.config.queue_capacity,
            "spawning dispatch workers"
        );

        for (kind, count, receiver) in [
            (QueueKind::Fresh, self.config.fresh_workers, &self.fresh_rx),
            (QueueKind::Retry, self.config.retry_workers, &self.retry_rx),
        ] {
            for worker_id in 0..count {
                let shared = self.shared.clone();
                let receiver = receiver.clone();
                let token = self.cancellation_token.clone();
                handles.push(tokio::spawn(run_worker(kind, worker_id, shared, receiver, token)));
            }
        }
    }

    /// Offers a newly created delivery to the fresh queue.
    pub fn enqueue_fresh(
        &self,
        delivery: &Delivery,
        subscription: Subscription,
    ) -> std::result::Result<(), EnqueueError> {
        self.enqueue(QueueKind::Fresh, delivery.id, subscription)
    }

    /// Offers a due or stranded delivery to the retry queue.
    pub fn enqueue_retry(
        &self,
        delivery: &Delivery,
        subscription: Subscription,
    ) -> std::result::Result<(), EnqueueError> {
        self.enqueue(QueueKind::Retry, delivery.id, subscription)
    }

    /// Non-blocking admission to one of the queues.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once shutdown began, `Quarantined` for
    /// deliveries held back after a persistence failure, `AlreadyQueued` if
    /// the delivery is queued or being attempted, and `QueueFull` when the
    /// queue is at capacity.
    pub fn enqueue(
        &self,
        queue: QueueKind,
        delivery_id: DeliveryId,
        subscription: Subscription,
    ) -> std::result::Result<(), EnqueueError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EnqueueError::ShuttingDown);
        }

        let mut tracking = self.shared.tracking();
        if tracking.quarantined.contains(&delivery_id) {
            return Err(EnqueueError::Quarantined { delivery_id });
        }
        if !tracking.in_flight.insert(delivery_id) {
            return Err(EnqueueError::AlreadyQueued { delivery_id });
        }

        let sender = match queue {
            QueueKind::Fresh => &self.fresh_tx,
            QueueKind::Retry => &self.retry_tx,
        };

        match sender.try_send(Job { delivery_id, subscription }) {
            Ok(()) => {
                debug!(delivery_id = %delivery_id, queue = %queue, "delivery enqueued");
                Ok(())
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracking.in_flight.remove(&delivery_id);
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(delivery_id = %delivery_id, queue = %queue, "dispatch queue full, delivery not enqueued");
                Err(EnqueueError::QueueFull { queue })
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracking.in_flight.remove(&delivery_id);
                Err(EnqueueError::ShuttingDown)
            },
        }
    }

    /// Snapshot of the deliveries held back after a persistence failure.
    pub fn quarantined(&self) -> HashSet<DeliveryId> {
        self.shared.tracking().quarantined.clone()
    }

    /// Whether the pool still admits work.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        let tracking = self.shared.tracking();
        PoolStats {
            active_workers: counters.active_workers.load(Ordering::Relaxed),
            in_flight: tracking.in_flight.len(),
            processed: counters.processed.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            persistence_errors: counters.persistence_errors.load(Ordering::Relaxed),
            quarantined: tracking.quarantined.len(),
        }
    }

    /// Stops admitting work, lets each worker finish its current attempt,
    /// and closes both queues.
    ///
    /// Deliveries still queued are dropped from memory; their records stay
    /// non-terminal in the store and are picked up again by the sweeps of
    /// the next run.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.accepting.store(false, Ordering::Release);
        self.cancellation_token.cancel();

        let handles = std::mem::take(
            &mut *self.worker_handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        info!(
            worker_count = handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful dispatch pool shutdown"
        );

        let join_all = async {
            for handle in handles {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "dispatch worker panicked during shutdown");
                }
            }
        };
        let joined = tokio::time::timeout(timeout, join_all).await;

        self.fresh_rx.lock().await.close();
        self.retry_rx.lock().await.close();

        match joined {
            Ok(()) => {
                let abandoned = {
                    let mut tracking = self.shared.tracking();
                    let count = tracking.in_flight.len();
                    tracking.in_flight.clear();
                    count
                };
                info!(abandoned, "dispatch pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "dispatch worker shutdown timed out, some attempts may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

async fn run_worker(
    kind: QueueKind,
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    token: CancellationToken,
) {
    shared.counters.active_workers.fetch_add(1, Ordering::Relaxed);
    debug!(queue = %kind, worker_id, "dispatch worker started");

    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        process(&shared, job).await;
    }

    shared.counters.active_workers.fetch_sub(1, Ordering::Relaxed);
    debug!(queue = %kind, worker_id, "dispatch worker stopped");
}

/// Runs one attempt, then records its outcome against the subscription.
async fn process(shared: &Shared, job: Job) {
    let Job { delivery_id, subscription } = job;
    let counters = &shared.counters;
    let mut quarantine = false;

    match shared.worker.deliver(delivery_id, &subscription).await {
        Ok(Some(report)) => {
            counters.processed.fetch_add(1, Ordering::Relaxed);
            if report.succeeded() {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }

            if report.persisted.is_err() {
                counters.persistence_errors.fetch_add(1, Ordering::Relaxed);
                quarantine = true;
            }

            if let Err(e) = shared
                .subscriptions
                .update_subscription_statistics(subscription.id, report.succeeded(), report.finished_at())
                .await
            {
                error!(
                    subscription_id = %subscription.id,
                    delivery_id = %delivery_id,
                    error = %e,
                    "failed to update subscription statistics"
                );
            }
        },
        Ok(None) => {},
        Err(error) => {
            if matches!(error, DeliveryError::Persistence { .. }) {
                counters.persistence_errors.fetch_add(1, Ordering::Relaxed);
            }
            error!(
                delivery_id = %delivery_id,
                subscription_id = %subscription.id,
                category = %ErrorCategory::from(&error),
                error = %error,
                at = %shared.clock.now_utc(),
                "delivery attempt could not be made"
            );
        },
    }

    let mut tracking = shared.tracking();
    tracking.in_flight.remove(&delivery_id);
    if quarantine {
        tracking.quarantined.insert(delivery_id);
    }
}
