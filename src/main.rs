//! Hookline webhook delivery service.
//!
//! Loads configuration, seeds subscriptions, starts the delivery engine and
//! feeds it events read as JSON lines from stdin. Runs until Ctrl-C or
//! SIGTERM, then drains in-progress attempts before exiting.

mod config;
mod ingest;

use std::sync::Arc;

use anyhow::{Context, Result};
use hookline_core::{Clock, RealClock};
use hookline_delivery::{storage::memory::InMemoryStorage, DeliveryEngine};
use tokio::io::BufReader;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        worker_count = config.worker_count,
        queue_capacity = config.queue_capacity,
        max_retries = config.max_retries,
        delivery_timeout_seconds = config.delivery_timeout_seconds,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = InMemoryStorage::new();
    let subscriptions = config.load_subscriptions(clock.now_utc())?;
    let registered = subscriptions.len();
    for subscription in subscriptions {
        let id = subscription.id;
        store
            .insert_subscription(subscription)
            .await
            .with_context(|| format!("Failed to register subscription {id}"))?;
    }
    info!(subscriptions = registered, "Subscriptions registered");

    let mut engine = DeliveryEngine::new(
        config.to_delivery_config(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        clock,
    )
    .context("Failed to create delivery engine")?;
    engine.start().context("Failed to start delivery engine")?;

    info!("Hookline is ready, reading events from stdin");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, starting graceful shutdown");
        },
        result = ingest::run(BufReader::new(tokio::io::stdin()), &engine) => {
            match result {
                Ok(ingested) => info!(ingested, "Event input closed, waiting for shutdown signal"),
                Err(e) => error!(error = %format!("{e:#}"), "Event input failed, waiting for shutdown signal"),
            }
            shutdown_signal().await;
            info!("Shutdown signal received, starting graceful shutdown");
        },
    }

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Delivery engine did not stop cleanly");
    }

    let stats = engine.stats();
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        rejected = stats.rejected,
        persistence_errors = stats.persistence_errors,
        "Hookline shutdown complete"
    );
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
