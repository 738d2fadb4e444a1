// Bounded TTL cache used for both the response cache and the advice cache.
// Capacity and TTL are mandatory so a cache can never grow without limit.
use crate::config::CacheConfig;
use moka::sync::Cache;
use shared::counter;
use shared::metrics_defs::MetricDef;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct BoundedCache<V> {
    cache: Cache<String, V>,
    hits: AtomicU64,
    misses: AtomicU64,
    hit_metric: MetricDef,
    miss_metric: MetricDef,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl<V: Clone + Send + Sync + 'static> BoundedCache<V> {
    pub fn new(config: &CacheConfig, hit_metric: MetricDef, miss_metric: MetricDef) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .time_to_live(config.ttl())
            .build();

        BoundedCache {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            hit_metric,
            miss_metric,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.cache.get(key);
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(self.hit_metric).increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(self.miss_metric).increment(1);
        }
        entry
    }

    pub fn insert(&self, key: &str, value: V) {
        self.cache.insert(key.to_string(), value);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }

    /// Flushes deferred eviction work so entry counts are exact.
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_defs::{RESPONSE_CACHE_HIT, RESPONSE_CACHE_MISS};
    use std::time::Duration;

    fn cache(capacity: u64, ttl_secs: u64) -> BoundedCache<String> {
        BoundedCache::new(
            &CacheConfig { capacity, ttl_secs },
            RESPONSE_CACHE_HIT,
            RESPONSE_CACHE_MISS,
        )
    }

    #[test]
    fn test_hit_and_miss_accounting() {
        let cache = cache(10, 60);

        assert_eq!(cache.get("a"), None);
        cache.insert("a", "advice".to_string());
        assert_eq!(cache.get("a").as_deref(), Some("advice"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_capacity_bound_holds() {
        let cache = cache(8, 60);

        for i in 0..100 {
            cache.insert(&format!("key-{i}"), "value".to_string());
        }
        cache.sync();

        assert!(cache.stats().entries <= 8, "entries = {}", cache.stats().entries);
    }

    #[test]
    fn test_ttl_expires_entries() {
        let cache = cache(10, 1);

        cache.insert("a", "advice".to_string());
        assert!(cache.get("a").is_some());

        std::thread::sleep(Duration::from_millis(1_100));
        assert_eq!(cache.get("a"), None);
    }
}
