//! Configuration for the dispatch subsystem.
//!
//! Every knob has a safe default and is clamped into a fixed safety range so
//! that a misconfigured deployment cannot exhaust process resources. Clamping
//! is logged, never silent.

use serde::Deserialize;
use std::fmt::Display;
use std::time::Duration;

const MAX_CONCURRENCY_CEILING: usize = 64;
const QUEUE_LEN_CEILING: usize = 10_000;
const TASK_TIMEOUT_CEILING_SECS: u64 = 300;
const METRICS_INTERVAL_CEILING_SECS: u64 = 300;

const THRESHOLD_CEILING: u32 = 100;
const RECOVERY_CEILING_SECS: u64 = 3_600;
const WINDOW_CEILING: usize = 1_000;

const BUCKET_CAPACITY_CEILING: f64 = 1_000.0;
const REFILL_RATE_CEILING: f64 = 1_000.0;

const RETRY_COUNT_CEILING: u32 = 10;
const RETRY_DELAY_CEILING_MS: u64 = 120_000;

const CACHE_CAPACITY_CEILING: u64 = 100_000;
const CACHE_TTL_CEILING_SECS: u64 = 86_400;

const SOCKETS_CEILING: usize = 256;
const HTTP_TIMEOUT_CEILING_SECS: u64 = 120;

const PENDING_TABLE_CEILING: usize = 4_096;

fn clamp_max<T: PartialOrd + Copy + Display>(option: &'static str, value: &mut T, ceiling: T) {
    if *value > ceiling {
        tracing::warn!(option, value = %*value, ceiling = %ceiling, "clamping option to safety ceiling");
        *value = ceiling;
    }
}

fn clamp_min<T: PartialOrd + Copy + Display>(option: &'static str, value: &mut T, floor: T) {
    if *value < floor {
        tracing::warn!(option, value = %*value, floor = %floor, "raising option to safety floor");
        *value = floor;
    }
}

/// Admission-controlled queue configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of tasks executing at once
    pub max_concurrency: usize,
    /// Admission ceiling: new submissions are rejected once the number of
    /// pending plus active tasks reaches this value
    pub max_queue_len: usize,
    /// How long a task may sit in the queue before it is rejected
    pub task_timeout_secs: u64,
    /// Interval of the periodic metrics emission while the queue is non-idle
    pub metrics_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_concurrency: 4,
            max_queue_len: 100,
            task_timeout_secs: 30,
            metrics_interval_secs: 5,
        }
    }
}

impl QueueConfig {
    pub fn clamp(&mut self) {
        clamp_min("queue.max_concurrency", &mut self.max_concurrency, 1);
        clamp_max(
            "queue.max_concurrency",
            &mut self.max_concurrency,
            MAX_CONCURRENCY_CEILING,
        );
        clamp_min("queue.max_queue_len", &mut self.max_queue_len, 1);
        clamp_max("queue.max_queue_len", &mut self.max_queue_len, QUEUE_LEN_CEILING);
        clamp_min("queue.task_timeout_secs", &mut self.task_timeout_secs, 1);
        clamp_max(
            "queue.task_timeout_secs",
            &mut self.task_timeout_secs,
            TASK_TIMEOUT_CEILING_SECS,
        );
        clamp_max(
            "queue.metrics_interval_secs",
            &mut self.metrics_interval_secs,
            METRICS_INTERVAL_CEILING_SECS,
        );
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Circuit breaker configuration.
///
/// `failure_threshold` is the starting point of the adaptive threshold,
/// which moves within `[min_threshold, max_threshold]` based on the recent
/// outcome window.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Capacity of the rolling outcome and latency windows
    pub window_size: usize,
    /// Minimum samples in the window before the error-rate trip applies
    pub window_min_samples: usize,
    /// Window error-rate fraction that trips the breaker
    pub error_rate_threshold: f64,
    /// Average latency under which the destination counts as fast
    pub fast_latency_ms: u64,
    /// Number of closed-state outcomes between threshold adjustments
    pub adjust_every: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            min_threshold: 2,
            max_threshold: 20,
            recovery_timeout_secs: 30,
            window_size: 50,
            window_min_samples: 10,
            error_rate_threshold: 0.1,
            fast_latency_ms: 500,
            adjust_every: 10,
        }
    }
}

impl BreakerConfig {
    pub fn clamp(&mut self) {
        clamp_min("breaker.failure_threshold", &mut self.failure_threshold, 1);
        clamp_max(
            "breaker.failure_threshold",
            &mut self.failure_threshold,
            THRESHOLD_CEILING,
        );
        clamp_min("breaker.min_threshold", &mut self.min_threshold, 1);
        clamp_min("breaker.max_threshold", &mut self.max_threshold, self.min_threshold);
        clamp_max("breaker.max_threshold", &mut self.max_threshold, THRESHOLD_CEILING);
        clamp_min("breaker.recovery_timeout_secs", &mut self.recovery_timeout_secs, 1);
        clamp_max(
            "breaker.recovery_timeout_secs",
            &mut self.recovery_timeout_secs,
            RECOVERY_CEILING_SECS,
        );
        clamp_min("breaker.window_size", &mut self.window_size, 1);
        clamp_max("breaker.window_size", &mut self.window_size, WINDOW_CEILING);
        clamp_max(
            "breaker.window_min_samples",
            &mut self.window_min_samples,
            self.window_size,
        );
        clamp_min("breaker.error_rate_threshold", &mut self.error_rate_threshold, 0.01);
        clamp_max("breaker.error_rate_threshold", &mut self.error_rate_threshold, 1.0);
        clamp_min("breaker.adjust_every", &mut self.adjust_every, 1);
    }

    pub fn base_recovery(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Token bucket configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            capacity: 10.0,
            refill_per_sec: 1.0,
        }
    }
}

impl BucketConfig {
    pub fn clamp(&mut self) {
        clamp_min("bucket.capacity", &mut self.capacity, 1.0);
        clamp_max("bucket.capacity", &mut self.capacity, BUCKET_CAPACITY_CEILING);
        clamp_min("bucket.refill_per_sec", &mut self.refill_per_sec, 0.01);
        clamp_max("bucket.refill_per_sec", &mut self.refill_per_sec, REFILL_RATE_CEILING);
    }
}

/// Retry and backoff configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt, so a call makes at most
    /// `max_retries + 1` attempts
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn clamp(&mut self) {
        clamp_max("retry.max_retries", &mut self.max_retries, RETRY_COUNT_CEILING);
        clamp_max("retry.base_delay_ms", &mut self.base_delay_ms, RETRY_DELAY_CEILING_MS);
        clamp_min("retry.max_delay_ms", &mut self.max_delay_ms, self.base_delay_ms);
        clamp_max("retry.max_delay_ms", &mut self.max_delay_ms, RETRY_DELAY_CEILING_MS);
    }
}

/// Bounded cache configuration. Capacity and TTL are always set; a cache
/// can never be configured unbounded.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 1_000,
            ttl_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn clamp(&mut self) {
        clamp_min("cache.capacity", &mut self.capacity, 1);
        clamp_max("cache.capacity", &mut self.capacity, CACHE_CAPACITY_CEILING);
        clamp_min("cache.ttl_secs", &mut self.ttl_secs, 1);
        clamp_max("cache.ttl_secs", &mut self.ttl_secs, CACHE_TTL_CEILING_SECS);
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Outbound HTTP and provider endpoint configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Upper bound on idle pooled connections to the destination
    pub max_sockets: usize,
    /// Lower bound the adaptive pool never shrinks below
    pub free_sockets: usize,
    /// Minimum time between adaptive pool resizes
    pub pool_resize_interval_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            endpoint: "http://127.0.0.1:8086/v1/analyze".into(),
            api_key: None,
            model: "analysis-1".into(),
            max_tokens: 512,
            timeout_secs: 30,
            max_sockets: 50,
            free_sockets: 10,
            pool_resize_interval_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn clamp(&mut self) {
        clamp_min("http.timeout_secs", &mut self.timeout_secs, 1);
        clamp_max("http.timeout_secs", &mut self.timeout_secs, HTTP_TIMEOUT_CEILING_SECS);
        clamp_min("http.max_sockets", &mut self.max_sockets, 1);
        clamp_max("http.max_sockets", &mut self.max_sockets, SOCKETS_CEILING);
        clamp_max("http.free_sockets", &mut self.free_sockets, self.max_sockets);
        clamp_min("http.pool_resize_interval_secs", &mut self.pool_resize_interval_secs, 1);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-call policy when the token bucket has no token available.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RatePolicy {
    /// Wait for the bucket to refill before dispatching
    #[default]
    Wait,
    /// Fail the dispatch immediately with a rate-limit error
    FailFast,
}

/// Aggregate configuration for the retrying dispatcher.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub bucket: BucketConfig,
    pub response_cache: CacheConfig,
    pub rate_policy: RatePolicy,
    /// Defensive ceiling on the de-duplication table; normal cleanup is
    /// completion-based
    pub max_pending: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            bucket: BucketConfig::default(),
            response_cache: CacheConfig {
                capacity: 500,
                ttl_secs: 300,
            },
            rate_policy: RatePolicy::default(),
            max_pending: 256,
        }
    }
}

impl DispatcherConfig {
    pub fn clamp(&mut self) {
        self.retry.clamp();
        self.breaker.clamp();
        self.bucket.clamp();
        self.response_cache.clamp();
        clamp_min("dispatcher.max_pending", &mut self.max_pending, 1);
        clamp_max("dispatcher.max_pending", &mut self.max_pending, PENDING_TABLE_CEILING);
    }
}
