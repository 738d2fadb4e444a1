pub mod breaker;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod fingerprint;
pub mod metrics_defs;
pub mod provider;
pub mod queue;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use bucket::TokenBucket;
pub use cache::{BoundedCache, CacheStats};
pub use config::{
    BreakerConfig, BucketConfig, CacheConfig, DispatcherConfig, HttpConfig, QueueConfig,
    RatePolicy, RetryConfig,
};
pub use dispatcher::{Dispatcher, DispatcherSnapshot};
pub use errors::{DispatchError, Result};
pub use provider::{AnalysisProvider, ClientPool, HttpAnalysisProvider, ProviderError};
pub use queue::{AdmissionQueue, QueueSnapshot};
