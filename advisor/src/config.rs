//! Aggregate configuration surface.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `ADVISOR_*` environment overrides, then a clamping pass that bounds
//! every knob to its safety range.

use dispatch::config::{CacheConfig, DispatcherConfig, HttpConfig, QueueConfig};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// StatsD endpoint for the metrics recorder.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StatsdConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_statsd_prefix")]
    pub prefix: String,
}

fn default_statsd_prefix() -> String {
    "advisor".into()
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvisorConfig {
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub advice_cache: CacheConfig,
    pub provider: HttpConfig,
    pub statsd: Option<StatsdConfig>,
}

impl AdvisorConfig {
    /// Loads YAML configuration, applies environment overrides and clamps.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: AdvisorConfig = serde_yaml::from_str(&text)?;
        config.apply_env();
        config.clamp();
        Ok(config)
    }

    /// Defaults plus environment overrides, clamped.
    pub fn from_env() -> Self {
        let mut config = AdvisorConfig::default();
        config.apply_env();
        config.clamp();
        config
    }

    pub fn clamp(&mut self) {
        self.queue.clamp();
        self.dispatcher.clamp();
        self.advice_cache.clamp();
        self.provider.clamp();
    }

    /// Applies `ADVISOR_*` environment variables over the current values.
    pub fn apply_env(&mut self) {
        env_override("ADVISOR_MAX_CONCURRENCY", &mut self.queue.max_concurrency);
        env_override("ADVISOR_QUEUE_CAPACITY", &mut self.queue.max_queue_len);
        env_override("ADVISOR_QUEUE_TIMEOUT_SECS", &mut self.queue.task_timeout_secs);
        env_override(
            "ADVISOR_METRICS_INTERVAL_SECS",
            &mut self.queue.metrics_interval_secs,
        );

        env_override("ADVISOR_RETRY_COUNT", &mut self.dispatcher.retry.max_retries);
        env_override("ADVISOR_RETRY_BASE_MS", &mut self.dispatcher.retry.base_delay_ms);
        env_override("ADVISOR_RETRY_MAX_MS", &mut self.dispatcher.retry.max_delay_ms);

        env_override(
            "ADVISOR_RESPONSE_CACHE_SIZE",
            &mut self.dispatcher.response_cache.capacity,
        );
        env_override(
            "ADVISOR_RESPONSE_CACHE_TTL_SECS",
            &mut self.dispatcher.response_cache.ttl_secs,
        );
        env_override("ADVISOR_ADVICE_CACHE_SIZE", &mut self.advice_cache.capacity);
        env_override("ADVISOR_ADVICE_CACHE_TTL_SECS", &mut self.advice_cache.ttl_secs);

        env_override(
            "ADVISOR_BREAKER_THRESHOLD",
            &mut self.dispatcher.breaker.failure_threshold,
        );
        env_override(
            "ADVISOR_BREAKER_RECOVERY_SECS",
            &mut self.dispatcher.breaker.recovery_timeout_secs,
        );

        env_override("ADVISOR_BUCKET_CAPACITY", &mut self.dispatcher.bucket.capacity);
        env_override(
            "ADVISOR_BUCKET_REFILL_RATE",
            &mut self.dispatcher.bucket.refill_per_sec,
        );

        env_override("ADVISOR_HTTP_TIMEOUT_SECS", &mut self.provider.timeout_secs);
        env_override("ADVISOR_MAX_SOCKETS", &mut self.provider.max_sockets);
        env_override("ADVISOR_FREE_SOCKETS", &mut self.provider.free_sockets);
        env_override("ADVISOR_ENDPOINT", &mut self.provider.endpoint);
        env_override("ADVISOR_MODEL", &mut self.provider.model);
        if let Ok(api_key) = std::env::var("ADVISOR_API_KEY") {
            self.provider.api_key = Some(api_key);
        }
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
        }
    }
}
