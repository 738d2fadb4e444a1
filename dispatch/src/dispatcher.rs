//! Retrying dispatcher with request de-duplication.
//!
//! A dispatch runs through, in order: the response cache, the pending
//! request table (identical concurrent requests share one outbound call),
//! the destination's token bucket, the destination's circuit breaker, and
//! finally the retry loop around the provider itself.

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::bucket::TokenBucket;
use crate::cache::{BoundedCache, CacheStats};
use crate::config::{DispatcherConfig, RatePolicy};
use crate::errors::DispatchError;
use crate::fingerprint;
use crate::metrics_defs::{
    BUCKET_THROTTLED, DISPATCH_DEDUPED, DISPATCH_RETRIES, RESPONSE_CACHE_HIT, RESPONSE_CACHE_MISS,
};
use crate::provider::{AnalysisProvider, ProviderError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::Rng;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type DispatchOutcome = Result<Arc<str>, DispatchError>;

/// Rate limiter and circuit breaker for one destination, created on first
/// use and reused for the destination's lifetime.
struct DestinationGuard {
    breaker: CircuitBreaker,
    bucket: TokenBucket,
}

/// Point-in-time view of the dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherSnapshot {
    pub response_cache: CacheStats,
    pub pending: usize,
    pub destinations: Vec<DestinationSnapshot>,
}

#[derive(Clone, Debug)]
pub struct DestinationSnapshot {
    pub destination: String,
    pub breaker: BreakerSnapshot,
    pub bucket_tokens: f64,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    provider: Arc<dyn AnalysisProvider>,
    response_cache: BoundedCache<Arc<str>>,
    pending: Mutex<IndexMap<String, watch::Receiver<Option<DispatchOutcome>>>>,
    guards: Mutex<HashMap<String, Arc<DestinationGuard>>>,
}

impl Dispatcher {
    pub fn new(mut config: DispatcherConfig, provider: Arc<dyn AnalysisProvider>) -> Self {
        config.clamp();
        let response_cache = BoundedCache::new(
            &config.response_cache,
            RESPONSE_CACHE_HIT,
            RESPONSE_CACHE_MISS,
        );
        Dispatcher {
            config,
            provider,
            response_cache,
            pending: Mutex::new(IndexMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatches `payload` to `destination`, de-duplicating against
    /// identical in-flight requests and caching successful responses.
    pub async fn dispatch(&self, destination: &str, payload: &str) -> DispatchOutcome {
        self.dispatch_with_policy(destination, payload, self.config.rate_policy)
            .await
    }

    /// Same as [`Dispatcher::dispatch`], with an explicit wait-or-fail
    /// policy for this call when the destination's token bucket is empty.
    pub async fn dispatch_with_policy(
        &self,
        destination: &str,
        payload: &str,
        rate_policy: RatePolicy,
    ) -> DispatchOutcome {
        let fingerprint = fingerprint::request_fingerprint(destination, payload).await;

        if let Some(cached) = self.response_cache.get(&fingerprint) {
            return Ok(cached);
        }

        enum Role {
            Leader(watch::Sender<Option<DispatchOutcome>>),
            Follower(watch::Receiver<Option<DispatchOutcome>>),
        }

        let role = {
            let mut pending = self.pending.lock();
            if let Some(rx) = pending.get(&fingerprint) {
                Role::Follower(rx.clone())
            } else {
                if pending.len() >= self.config.max_pending {
                    // Defensive ceiling; completion-based cleanup below is
                    // the normal removal path
                    if let Some((evicted, _)) = pending.shift_remove_index(0) {
                        tracing::warn!(
                            fingerprint = %evicted,
                            "pending request table overflow, evicting oldest entry"
                        );
                    }
                }
                let (tx, rx) = watch::channel(None);
                pending.insert(fingerprint.clone(), rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => {
                counter!(DISPATCH_DEDUPED).increment(1);
                match rx.wait_for(|outcome| outcome.is_some()).await {
                    Ok(settled) => settled
                        .clone()
                        .unwrap_or_else(|| Err(DispatchError::Internal("empty dispatch slot".into()))),
                    Err(_) => {
                        // The leader was dropped without settling; clear the
                        // stale entry so later callers can lead again
                        self.pending.lock().shift_remove(&fingerprint);
                        Err(DispatchError::Internal("in-flight dispatch was dropped".into()))
                    }
                }
            }
            Role::Leader(tx) => {
                let outcome = self
                    .run_leader(destination, payload, &fingerprint, rate_policy)
                    .await;
                let _ = tx.send(Some(outcome.clone()));
                self.pending.lock().shift_remove(&fingerprint);
                outcome
            }
        }
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let destinations = self
            .guards
            .lock()
            .iter()
            .map(|(destination, guard)| DestinationSnapshot {
                destination: destination.clone(),
                breaker: guard.breaker.snapshot(),
                bucket_tokens: guard.bucket.available(),
            })
            .collect();
        DispatcherSnapshot {
            response_cache: self.response_cache.stats(),
            pending: self.pending.lock().len(),
            destinations,
        }
    }

    async fn run_leader(
        &self,
        destination: &str,
        payload: &str,
        fingerprint: &str,
        rate_policy: RatePolicy,
    ) -> DispatchOutcome {
        let guard = self.guard_for(destination);

        match rate_policy {
            RatePolicy::Wait => {
                if !guard.bucket.try_consume(1.0) {
                    counter!(BUCKET_THROTTLED, "policy" => "wait").increment(1);
                    guard.bucket.acquire(1.0).await;
                }
            }
            RatePolicy::FailFast => {
                if !guard.bucket.try_consume(1.0) {
                    counter!(BUCKET_THROTTLED, "policy" => "fail_fast").increment(1);
                    return Err(DispatchError::RateLimited {
                        retry_after: guard.bucket.next_available_delay(),
                    });
                }
            }
        }

        let result = guard
            .breaker
            .execute(|| self.call_with_retries(payload))
            .await;

        if let Ok(value) = &result {
            self.response_cache.insert(fingerprint, Arc::clone(value));
        }
        result
    }

    /// Retry loop: exponential backoff with jitter, capped at the
    /// configured maximum, honoring provider throttle hints when present.
    async fn call_with_retries(&self, payload: &str) -> DispatchOutcome {
        let mut attempt = 0;
        loop {
            match self.provider.analyze(payload).await {
                Ok(analysis) => return Ok(Arc::from(analysis)),
                Err(err) if !err.is_retryable() => {
                    return Err(DispatchError::Provider(err));
                }
                Err(err) => {
                    if attempt >= self.config.retry.max_retries {
                        return Err(DispatchError::RetryExhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    let delay = self.retry_delay(attempt, &err);
                    counter!(DISPATCH_RETRIES).increment(1);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn retry_delay(&self, attempt: u32, err: &ProviderError) -> Duration {
        let retry = &self.config.retry;
        let cap = Duration::from_millis(retry.max_delay_ms);
        let base = Duration::from_millis(retry.base_delay_ms);

        let jitter = if retry.base_delay_ms > 0 {
            rand::thread_rng().gen_range(0.0..base.as_secs_f64())
        } else {
            0.0
        };
        let computed = Duration::from_secs_f64(
            base.as_secs_f64() * 2_f64.powi(attempt as i32) + jitter,
        )
        .min(cap);

        match err {
            ProviderError::Throttled {
                retry_after: Some(hint),
            }
            | ProviderError::Unavailable {
                retry_after: Some(hint),
            } => (*hint).min(cap),
            ProviderError::Throttled { retry_after: None }
            | ProviderError::Unavailable { retry_after: None } => (computed * 2).min(cap),
            _ => computed,
        }
    }

    fn guard_for(&self, destination: &str) -> Arc<DestinationGuard> {
        let mut guards = self.guards.lock();
        Arc::clone(guards.entry(destination.to_string()).or_insert_with(|| {
            Arc::new(DestinationGuard {
                breaker: CircuitBreaker::new(self.config.breaker.clone()),
                bucket: TokenBucket::new(&self.config.bucket),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, BucketConfig, CacheConfig, RetryConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Provider that fails a fixed number of times before succeeding.
    struct FlakyProvider {
        calls: AtomicU32,
        failures: u32,
        error: ProviderError,
        gate: Option<Arc<Notify>>,
    }

    impl FlakyProvider {
        fn new(failures: u32, error: ProviderError) -> Arc<Self> {
            Arc::new(FlakyProvider {
                calls: AtomicU32::new(0),
                failures,
                error,
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(FlakyProvider {
                calls: AtomicU32::new(0),
                failures: 0,
                error: ProviderError::Timeout,
                gate: Some(gate),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisProvider for FlakyProvider {
        async fn analyze(&self, _prompt: &str) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if call <= self.failures {
                Err(self.error.clone())
            } else {
                Ok("advice".to_string())
            }
        }
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 100,
                max_delay_ms: 5_000,
            },
            breaker: BreakerConfig::default(),
            bucket: BucketConfig {
                capacity: 100.0,
                refill_per_sec: 100.0,
            },
            response_cache: CacheConfig {
                capacity: 100,
                ttl_secs: 60,
            },
            rate_policy: RatePolicy::FailFast,
            max_pending: 16,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let provider = FlakyProvider::new(2, ProviderError::Timeout);
        let dispatcher = Dispatcher::new(test_config(), provider.clone());

        let result = dispatcher.dispatch("provider", "payload").await.unwrap();
        assert_eq!(&*result, "advice");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_wraps_last_error() {
        let provider = FlakyProvider::new(10, ProviderError::Timeout);
        let dispatcher = Dispatcher::new(test_config(), provider.clone());

        let err = dispatcher.dispatch("provider", "payload").await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::RetryExhausted {
                attempts: 4,
                last: ProviderError::Timeout,
            }
        );
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_propagates_immediately() {
        let provider = FlakyProvider::new(10, ProviderError::MalformedResponse("bad".into()));
        let dispatcher = Dispatcher::new(test_config(), provider.clone());

        let err = dispatcher.dispatch("provider", "payload").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Provider(ProviderError::MalformedResponse(_))
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_response_is_cached() {
        let provider = FlakyProvider::new(0, ProviderError::Timeout);
        let dispatcher = Dispatcher::new(test_config(), provider.clone());

        let first = dispatcher.dispatch("provider", "payload").await.unwrap();
        let second = dispatcher.dispatch("provider", "payload").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.calls(), 1);
        assert_eq!(dispatcher.snapshot().response_cache.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_concurrent_dispatches_share_one_call() {
        let gate = Arc::new(Notify::new());
        let provider = FlakyProvider::gated(Arc::clone(&gate));
        let dispatcher = Arc::new(Dispatcher::new(test_config(), provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch("provider", "payload").await
            }));
        }
        while dispatcher.snapshot().pending < 1 {
            tokio::task::yield_now().await;
        }
        // Give the followers time to subscribe, then release the leader
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(provider.calls(), 1);
        assert!(Arc::ptr_eq(&results[0], &results[1]));
        assert!(Arc::ptr_eq(&results[0], &results[2]));
        assert_eq!(dispatcher.snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deduped_error_is_shared() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
            error: ProviderError::MalformedResponse("bad".into()),
            gate: Some(Arc::clone(&gate)),
        });
        let dispatcher = Arc::new(Dispatcher::new(test_config(), provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch("provider", "payload").await
            }));
        }
        while dispatcher.snapshot().pending < 1 {
            tokio::task::yield_now().await;
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let mut errors = Vec::new();
        for handle in handles {
            errors.push(handle.await.unwrap().unwrap_err());
        }

        assert_eq!(provider.calls(), 1);
        assert_eq!(errors[0], errors[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fail_fast() {
        let provider = FlakyProvider::new(0, ProviderError::Timeout);
        let config = DispatcherConfig {
            bucket: BucketConfig {
                capacity: 1.0,
                refill_per_sec: 0.1,
            },
            ..test_config()
        };
        let dispatcher = Dispatcher::new(config, provider.clone());

        dispatcher.dispatch("provider", "first").await.unwrap();
        let err = dispatcher.dispatch("provider", "second").await.unwrap_err();

        assert!(matches!(
            err,
            DispatchError::RateLimited { retry_after } if retry_after > Duration::ZERO
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_policy_overrides_default() {
        let provider = FlakyProvider::new(0, ProviderError::Timeout);
        let config = DispatcherConfig {
            bucket: BucketConfig {
                capacity: 1.0,
                refill_per_sec: 0.1,
            },
            rate_policy: RatePolicy::Wait,
            ..test_config()
        };
        let dispatcher = Dispatcher::new(config, provider.clone());

        dispatcher.dispatch("provider", "first").await.unwrap();
        let err = dispatcher
            .dispatch_with_policy("provider", "second", RatePolicy::FailFast)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::RateLimited { .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_wait_policy_dispatches_after_refill() {
        let provider = FlakyProvider::new(0, ProviderError::Timeout);
        let config = DispatcherConfig {
            bucket: BucketConfig {
                capacity: 1.0,
                refill_per_sec: 1.0,
            },
            rate_policy: RatePolicy::Wait,
            ..test_config()
        };
        let dispatcher = Dispatcher::new(config, provider.clone());

        dispatcher.dispatch("provider", "first").await.unwrap();
        dispatcher.dispatch("provider", "second").await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_hint_shortens_backoff() {
        let provider = FlakyProvider::new(
            1,
            ProviderError::Throttled {
                retry_after: Some(Duration::from_millis(50)),
            },
        );
        let dispatcher = Dispatcher::new(test_config(), provider.clone());

        let started = tokio::time::Instant::now();
        dispatcher.dispatch("provider", "payload").await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(provider.calls(), 2);
        // The 50ms hint is honored instead of the 100ms+ exponential delay
        assert!(elapsed < Duration::from_millis(100), "elapsed = {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_dispatch() {
        let provider = FlakyProvider::new(u32::MAX, ProviderError::Timeout);
        let config = DispatcherConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                min_threshold: 2,
                ..BreakerConfig::default()
            },
            ..test_config()
        };
        let dispatcher = Dispatcher::new(config, provider.clone());

        // Each dispatch exhausts retries and counts one breaker failure
        for payload in ["a", "b"] {
            let err = dispatcher.dispatch("provider", payload).await.unwrap_err();
            assert!(matches!(err, DispatchError::RetryExhausted { .. }));
        }

        let err = dispatcher.dispatch("provider", "c").await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { .. }));
        let calls_when_open = provider.calls();

        let err = dispatcher.dispatch("provider", "d").await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { .. }));
        assert_eq!(provider.calls(), calls_when_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_table_defensive_ceiling() {
        let gate = Arc::new(Notify::new());
        let provider = FlakyProvider::gated(Arc::clone(&gate));
        let config = DispatcherConfig {
            max_pending: 2,
            ..test_config()
        };
        let dispatcher = Arc::new(Dispatcher::new(config, provider.clone()));

        let mut handles = Vec::new();
        for payload in ["a", "b", "c"] {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch("provider", payload).await
            }));
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }

        assert!(dispatcher.snapshot().pending <= 2);

        for _ in 0..3 {
            gate.notify_one();
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }
    }
}
