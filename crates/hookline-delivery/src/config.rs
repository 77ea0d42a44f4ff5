//! Engine configuration.

use std::time::Duration;

use crate::{
    client::{ClientConfig, DEFAULT_USER_AGENT},
    error::{DeliveryError, Result},
    retry::RetryPolicy,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Workers draining the fresh queue. The retry queue gets
    /// `max(1, worker_count / 2)` of its own.
    pub worker_count: usize,

    /// Capacity of each of the two queues.
    pub queue_capacity: usize,

    /// Total attempts allowed per delivery, including the first.
    pub max_retries: u32,

    /// Delay after the first failed attempt.
    pub initial_retry_delay: Duration,

    /// Upper bound on any single retry delay.
    pub max_retry_delay: Duration,

    /// Per-attempt HTTP timeout.
    pub delivery_timeout: Duration,

    /// How often the retry sweep runs.
    pub retry_check_interval: Duration,

    /// Age after which terminal deliveries are deleted.
    pub retention_days: u32,

    /// How often the retention sweep runs.
    pub retention_check_interval: Duration,

    /// Maximum rows examined per sweep query.
    pub sweep_batch_size: usize,

    /// Age after which a never-dispatched pending delivery is re-submitted.
    pub stranded_after: Duration,

    /// Maximum time to wait for workers to finish their current attempt.
    pub shutdown_timeout: Duration,

    /// User agent sent with every webhook request.
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            max_retries: 5,
            initial_retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(3600),
            delivery_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            retry_check_interval: Duration::from_secs(30),
            retention_days: 30,
            retention_check_interval: Duration::from_secs(24 * 60 * 60),
            sweep_batch_size: 100,
            stranded_after: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Rejects configurations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 10] = [
            (self.worker_count == 0, "worker_count must be greater than 0"),
            (self.queue_capacity == 0, "queue_capacity must be greater than 0"),
            (self.max_retries == 0, "max_retries must be greater than 0"),
            (self.initial_retry_delay.is_zero(), "initial_retry_delay must be greater than 0"),
            (
                self.max_retry_delay < self.initial_retry_delay,
                "max_retry_delay cannot be less than initial_retry_delay",
            ),
            (self.delivery_timeout.is_zero(), "delivery_timeout must be greater than 0"),
            (self.retry_check_interval.is_zero(), "retry_check_interval must be greater than 0"),
            (self.retention_days == 0, "retention_days must be greater than 0"),
            (
                self.retention_check_interval.is_zero(),
                "retention_check_interval must be greater than 0",
            ),
            (self.sweep_batch_size == 0, "sweep_batch_size must be greater than 0"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(DeliveryError::configuration(*message)),
            None => Ok(()),
        }
    }

    /// Workers dedicated to the retry queue.
    pub fn retry_worker_count(&self) -> usize {
        (self.worker_count / 2).max(1)
    }

    /// Backoff policy derived from the retry settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_retry_delay,
            max_delay: self.max_retry_delay,
        }
    }

    /// HTTP client settings derived from the delivery settings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig { timeout: self.delivery_timeout, user_agent: self.user_agent.clone() }
    }

    /// Retention window as a signed duration for cutoff arithmetic.
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep_batch_size, 100);
        assert_eq!(config.user_agent, "Hookline-Webhook-Delivery/1.0");
    }

    #[test]
    fn retry_workers_are_half_with_floor_of_one() {
        let mut config = DeliveryConfig { worker_count: 1, ..DeliveryConfig::default() };
        assert_eq!(config.retry_worker_count(), 1);

        config.worker_count = 7;
        assert_eq!(config.retry_worker_count(), 3);

        config.worker_count = 10;
        assert_eq!(config.retry_worker_count(), 5);
    }

    #[test]
    fn zero_values_rejected() {
        let config = DeliveryConfig { worker_count: 0, ..DeliveryConfig::default() };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("worker_count"));

        let config = DeliveryConfig { queue_capacity: 0, ..DeliveryConfig::default() };
        assert!(config.validate().is_err());

        let config = DeliveryConfig { max_retries: 0, ..DeliveryConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cap_below_initial_delay_rejected() {
        let config = DeliveryConfig {
            initial_retry_delay: Duration::from_secs(120),
            max_retry_delay: Duration::from_secs(60),
            ..DeliveryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_settings_follow_fields() {
        let config = DeliveryConfig {
            max_retries: 3,
            delivery_timeout: Duration::from_secs(5),
            ..DeliveryConfig::default()
        };

        assert_eq!(config.retry_policy().max_retries, 3);
        assert_eq!(config.client_config().timeout, Duration::from_secs(5));
        assert_eq!(config.retention_window(), chrono::Duration::days(30));
    }
}
