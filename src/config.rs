//! Configuration management for the hookline service.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_core::{Subscription, SubscriptionId};
use hookline_delivery::{client::DEFAULT_USER_AGENT, DeliveryConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookline.toml";
const ENV_PREFIX: &str = "HOOKLINE_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `HOOKLINE_` (highest priority)
/// 2. Configuration file (`hookline.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Durations are whole seconds so every field can be set from a plain
/// environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // Dispatch
    /// Workers on the fresh-delivery queue.
    ///
    /// Environment variable: `HOOKLINE_WORKER_COUNT`
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of each dispatch queue.
    ///
    /// Environment variable: `HOOKLINE_QUEUE_CAPACITY`
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    // Retry
    /// Attempts allowed per delivery before it fails.
    ///
    /// Environment variable: `HOOKLINE_MAX_RETRIES`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    ///
    /// Environment variable: `HOOKLINE_INITIAL_RETRY_DELAY_SECONDS`
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_seconds: u64,
    /// Upper bound on any single retry delay.
    ///
    /// Environment variable: `HOOKLINE_MAX_RETRY_DELAY_SECONDS`
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,
    /// Period of the retry sweep.
    ///
    /// Environment variable: `HOOKLINE_RETRY_CHECK_INTERVAL_SECONDS`
    #[serde(default = "default_retry_check_interval")]
    pub retry_check_interval_seconds: u64,
    /// Rows read per query in one sweep.
    ///
    /// Environment variable: `HOOKLINE_SWEEP_BATCH_SIZE`
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
    /// Age after which an undispatched pending delivery is recovered.
    ///
    /// Environment variable: `HOOKLINE_STRANDED_AFTER_SECONDS`
    #[serde(default = "default_stranded_after")]
    pub stranded_after_seconds: u64,

    // Client
    /// Timeout for one delivery request.
    ///
    /// Environment variable: `HOOKLINE_DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    /// User agent sent with every delivery.
    ///
    /// Environment variable: `HOOKLINE_USER_AGENT`
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Retention
    /// Days terminal deliveries are kept.
    ///
    /// Environment variable: `HOOKLINE_RETENTION_DAYS`
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Period of the retention sweep.
    ///
    /// Environment variable: `HOOKLINE_RETENTION_CHECK_INTERVAL_SECONDS`
    #[serde(default = "default_retention_check_interval")]
    pub retention_check_interval_seconds: u64,

    // Lifecycle
    /// Bound on waiting for in-progress attempts at shutdown.
    ///
    /// Environment variable: `HOOKLINE_SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// JSON file of subscriptions loaded at startup.
    ///
    /// Environment variable: `HOOKLINE_SUBSCRIPTIONS_FILE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptions_file: Option<PathBuf>,

    // Logging
    /// Log filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `HOOKLINE_RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `hookline.toml` in the working
    /// directory, and `HOOKLINE_` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`Config::load`] with an explicit configuration file. A missing
    /// file is skipped.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the delivery engine's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            initial_retry_delay: Duration::from_secs(self.initial_retry_delay_seconds),
            max_retry_delay: Duration::from_secs(self.max_retry_delay_seconds),
            delivery_timeout: Duration::from_secs(self.delivery_timeout_seconds),
            retry_check_interval: Duration::from_secs(self.retry_check_interval_seconds),
            retention_days: self.retention_days,
            retention_check_interval: Duration::from_secs(self.retention_check_interval_seconds),
            sweep_batch_size: self.sweep_batch_size,
            stranded_after: Duration::from_secs(self.stranded_after_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            user_agent: self.user_agent.clone(),
        }
    }

    /// Reads the subscriptions file, if one is configured.
    pub fn load_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let Some(path) = &self.subscriptions_file else {
            return Ok(Vec::new());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read subscriptions file {}", path.display()))?;
        let entries: Vec<SubscriptionEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid subscriptions file {}", path.display()))?;

        Ok(entries.into_iter().map(|entry| entry.into_subscription(now)).collect())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty");
        }

        if self.shutdown_timeout_seconds == 0 {
            anyhow::bail!("shutdown_timeout_seconds must be greater than 0");
        }

        self.to_delivery_config().validate().context("Invalid delivery configuration")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            initial_retry_delay_seconds: default_initial_retry_delay(),
            max_retry_delay_seconds: default_max_retry_delay(),
            retry_check_interval_seconds: default_retry_check_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            stranded_after_seconds: default_stranded_after(),
            delivery_timeout_seconds: default_delivery_timeout(),
            user_agent: default_user_agent(),
            retention_days: default_retention_days(),
            retention_check_interval_seconds: default_retention_check_interval(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            subscriptions_file: None,
            rust_log: default_log_level(),
        }
    }
}

/// One subscription as written in the subscriptions file.
#[derive(Debug, Clone, Deserialize)]
struct SubscriptionEntry {
    #[serde(default)]
    id: Option<SubscriptionId>,
    target_url: String,
    secret: String,
    #[serde(default)]
    event_types: Vec<String>,
    #[serde(default = "default_active")]
    active: bool,
}

impl SubscriptionEntry {
    fn into_subscription(self, now: DateTime<Utc>) -> Subscription {
        let mut subscription = Subscription::new(self.target_url, self.secret, self.event_types, now);
        if let Some(id) = self.id {
            subscription.id = id;
        }
        subscription.active = self.active;
        subscription
    }
}

fn default_worker_count() -> usize {
    hookline_delivery::DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    hookline_delivery::DEFAULT_QUEUE_CAPACITY
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_retry_delay() -> u64 {
    60
}

fn default_max_retry_delay() -> u64 {
    3600
}

fn default_retry_check_interval() -> u64 {
    30
}

fn default_sweep_batch_size() -> usize {
    100
}

fn default_stranded_after() -> u64 {
    300
}

fn default_delivery_timeout() -> u64 {
    hookline_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_retention_check_interval() -> u64 {
    24 * 60 * 60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_active() -> bool {
    true
}

fn default_log_level() -> String {
    "info,hookline=debug".to_string()
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, env, io::Write, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            self.originals.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for (key, original) in &self.originals {
                match original {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn missing_file() -> PathBuf {
        PathBuf::from("/nonexistent/hookline.toml")
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.to_delivery_config(), DeliveryConfig::default());
    }

    #[test]
    fn env_overrides_defaults() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("HOOKLINE_WORKER_COUNT", "8");
        guard.set_var("HOOKLINE_MAX_RETRIES", "3");
        guard.set_var("HOOKLINE_INITIAL_RETRY_DELAY_SECONDS", "10");
        guard.set_var("HOOKLINE_USER_AGENT", "Custom/2.0");

        let config = Config::load_from(missing_file()).expect("config should load");

        assert_eq!(config.worker_count, 8);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.user_agent, "Custom/2.0");

        let delivery = config.to_delivery_config();
        assert_eq!(delivery.initial_retry_delay, Duration::from_secs(10));
        assert_eq!(delivery.retry_worker_count(), 4);
    }

    #[test]
    fn file_values_sit_between_defaults_and_env() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("HOOKLINE_QUEUE_CAPACITY", "50");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_capacity = 10\nretention_days = 7").unwrap();

        let config = Config::load_from(file.path()).expect("config should load");

        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.max_retries, default_max_retries());
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = Config::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.initial_retry_delay_seconds = 120;
        config.max_retry_delay_seconds = 60;
        assert!(config.validate().is_err());

        config = Config::default();
        config.user_agent = "  ".to_string();
        assert!(config.validate().is_err());

        let mut guard = TestEnvGuard::new();
        guard.set_var("HOOKLINE_MAX_RETRIES", "0");
        assert!(Config::load_from(missing_file()).is_err());
    }

    #[test]
    fn subscriptions_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"target_url": "https://a.example/hook", "secret": "s1", "event_types": ["blog.*"]}},
                {{"target_url": "https://b.example/hook", "secret": "s2", "active": false}}
            ]"#
        )
        .unwrap();

        let config =
            Config { subscriptions_file: Some(file.path().to_path_buf()), ..Config::default() };
        let subscriptions = config.load_subscriptions(Utc::now()).unwrap();

        assert_eq!(subscriptions.len(), 2);
        assert_eq!(subscriptions[0].event_types, vec!["blog.*".to_string()]);
        assert!(subscriptions[0].active);
        assert!(subscriptions[1].event_types.is_empty());
        assert!(!subscriptions[1].active);
    }

    #[test]
    fn no_subscriptions_file_means_empty() {
        let subscriptions = Config::default().load_subscriptions(Utc::now()).unwrap();
        assert!(subscriptions.is_empty());
    }
}
