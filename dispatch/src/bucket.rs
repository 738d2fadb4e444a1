//! Per-destination token bucket rate limiter.

use crate::config::BucketConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket with lazy refill.
///
/// Tokens are only replenished at consumption time, based on the elapsed
/// time since the last refill, and never exceed the configured capacity.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &BucketConfig) -> Self {
        TokenBucket {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            inner: Mutex::new(BucketInner {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        inner.last_refill = now;
    }

    /// Consumes `n` tokens if available. Returns `false` without mutating
    /// the balance when there are not enough tokens.
    pub fn try_consume(&self, n: f64) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= n {
            inner.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Time until at least one token is available. Zero when a token is
    /// available right now.
    pub fn next_available_delay(&self) -> Duration {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - inner.tokens) / self.refill_per_sec)
        }
    }

    /// Waits until `n` tokens can be consumed, then consumes them.
    pub async fn acquire(&self, n: f64) {
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                self.refill(&mut inner);
                if inner.tokens >= n {
                    inner.tokens -= n;
                    return;
                }
                Duration::from_secs_f64((n - inner.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        inner.tokens
    }
}
