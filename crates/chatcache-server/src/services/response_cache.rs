use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::activity::ActivityTracker;
use super::atomic::AtomicUpdater;
use super::keys;
use crate::config::CacheConfig;
use crate::models::{ActivityScope, CacheEntry, RankedEntry};
use crate::store::KvStore;
use crate::utils::{Clock, ServiceError, ServiceResult};

const HITS_FIELD: &str = "cache_hits";
const MISSES_FIELD: &str = "cache_misses";
const CACHED_FIELD: &str = "responses_cached";
const REQUESTS_FIELD: &str = "total_requests";

/// Aggregate cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Chat requests seen, cached or not
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub responses_cached: u64,
    /// hits / (hits + misses) as a percentage, two decimals
    pub hit_ratio: f64,
}

/// Hex SHA-256 of `input|model|temperature`
pub fn derive_key(input: &str, model: &str, temperature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.update(b"|");
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(temperature.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whole temperatures keep one decimal so 1 and 1.0 address the same entry
pub fn format_temperature(temperature: f64) -> String {
    if temperature.fract() == 0.0 {
        format!("{:.1}", temperature)
    } else {
        temperature.to_string()
    }
}

/// Content-addressed reply cache with hit/miss accounting
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    atomic: Arc<AtomicUpdater>,
    activity: Arc<ActivityTracker>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        atomic: Arc<AtomicUpdater>,
        activity: Arc<ActivityTracker>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            atomic,
            activity,
            config,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.response_ttl_secs.max(1))
    }

    fn temperature_literal(&self, temperature: Option<f64>) -> String {
        temperature
            .map(format_temperature)
            .unwrap_or_else(|| self.config.default_temperature.clone())
    }

    pub fn cache_key(&self, input: &str, model: &str, temperature: Option<f64>) -> String {
        derive_key(input, model, &self.temperature_literal(temperature))
    }

    /// On hit, bump the entry's hit counter and refresh its TTL.
    /// Store failures and unreadable entries count as misses.
    pub async fn lookup(&self, input: &str, model: &str, temperature: Option<f64>) -> Option<CacheEntry> {
        let hash = self.cache_key(input, model, temperature);
        let key = keys::cached_response(&hash);

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache lookup for {} failed, treating as miss: {}", hash, e);
                self.bump_stat(MISSES_FIELD).await;
                return None;
            }
        };

        let mut entry = match raw.map(|r| serde_json::from_str::<CacheEntry>(&r)) {
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                warn!("Corrupt cache entry {}, treating as miss: {}", hash, e);
                self.bump_stat(MISSES_FIELD).await;
                return None;
            }
            None => {
                debug!("Cache miss for {}", hash);
                self.bump_stat(MISSES_FIELD).await;
                return None;
            }
        };

        // best-effort: concurrent hits may overwrite each other's count
        entry.hit_count += 1;
        match serde_json::to_string(&entry) {
            Ok(json) => {
                if let Err(e) = self.store.set(&key, &json, Some(self.ttl())).await {
                    warn!("Failed to refresh cache entry {}: {}", hash, e);
                }
            }
            Err(e) => warn!("Failed to encode cache entry {}: {}", hash, e),
        }

        self.bump_stat(HITS_FIELD).await;
        debug!("Cache hit for {} (hits: {})", hash, entry.hit_count);
        Some(entry)
    }

    /// Write a fresh entry. Returns false when the store rejected the write.
    pub async fn store(
        &self,
        session_id: &str,
        input: &str,
        reply: &str,
        model: &str,
        temperature: Option<f64>,
    ) -> ServiceResult<bool> {
        let entry = self.entry(session_id, input, reply, model, temperature)?;
        let json = serde_json::to_string(&entry)?;

        match self
            .store
            .set(&keys::cached_response(&entry.key), &json, Some(self.ttl()))
            .await
        {
            Ok(()) => {
                self.bump_stat(CACHED_FIELD).await;
                debug!("Cached response {} for session {}", entry.key, session_id);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to cache response for session {}: {}", session_id, e);
                Ok(false)
            }
        }
    }

    /// Seed an entry unless a fresh one is already present
    pub async fn warm(
        &self,
        session_id: &str,
        input: &str,
        reply: &str,
        model: &str,
        temperature: Option<f64>,
    ) -> ServiceResult<bool> {
        let entry = self.entry(session_id, input, reply, model, temperature)?;
        let json = serde_json::to_string(&entry)?;

        let written = match self
            .atomic
            .set_if_stale(&keys::cached_response(&entry.key), &json, self.ttl())
            .await
        {
            Ok(written) => written,
            Err(e) => {
                warn!("Failed to warm cache entry {}: {}", entry.key, e);
                false
            }
        };
        if written {
            self.bump_stat(CACHED_FIELD).await;
        }
        Ok(written)
    }

    fn entry(
        &self,
        session_id: &str,
        input: &str,
        reply: &str,
        model: &str,
        temperature: Option<f64>,
    ) -> ServiceResult<CacheEntry> {
        if model.trim().is_empty() {
            return Err(ServiceError::Validation("Model cannot be null or empty".to_string()));
        }
        let temperature = self.temperature_literal(temperature);
        Ok(CacheEntry {
            key: derive_key(input, model, &temperature),
            response: reply.to_string(),
            session_id: session_id.to_string(),
            model: model.to_string(),
            temperature,
            cached_at: self.clock.now(),
            hit_count: 0,
        })
    }

    /// Count one incoming chat request
    pub async fn record_request(&self) {
        self.bump_stat(REQUESTS_FIELD).await;
    }

    async fn bump_stat(&self, field: &str) {
        if let Err(e) = self.store.hincr_by(keys::CACHE_STATS, field, 1).await {
            warn!("Failed to update cache stat {}: {}", field, e);
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let counters = match self.store.hgetall(keys::CACHE_STATS).await {
            Ok(counters) => counters,
            Err(e) => {
                warn!("Reading cache stats failed: {}", e);
                return CacheStats::default();
            }
        };
        let read = |field: &str| counters.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);

        let cache_hits = read(HITS_FIELD);
        let cache_misses = read(MISSES_FIELD);
        let lookups = cache_hits + cache_misses;
        let hit_ratio = if lookups > 0 {
            (cache_hits as f64 / lookups as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        CacheStats {
            total_requests: read(REQUESTS_FIELD),
            cache_hits,
            cache_misses,
            responses_cached: read(CACHED_FIELD),
            hit_ratio,
        }
    }

    pub async fn most_active_sessions(&self, limit: usize) -> Vec<RankedEntry> {
        self.activity.most_active(ActivityScope::Sessions, limit).await
    }

    pub async fn most_active_users(&self, limit: usize) -> Vec<RankedEntry> {
        self.activity.most_active(ActivityScope::Users, limit).await
    }

    /// Delete one batch of cached responses; counters are kept
    pub async fn clear(&self) -> ServiceResult<u64> {
        self.atomic
            .bulk_delete(&keys::all_under(keys::CACHE_RESPONSE_PREFIX))
            .await
    }

    pub async fn size(&self) -> u64 {
        match self.store.keys(&keys::all_under(keys::CACHE_RESPONSE_PREFIX)).await {
            Ok(keys) => keys.len() as u64,
            Err(e) => {
                warn!("Counting cache entries failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActivityConfig, CleanupConfig, RateLimitConfig, SessionConfig};
    use crate::store::{MemoryStore, MockKvStore};
    use crate::utils::{ManualClock, StoreError};

    fn cache_over(store: Arc<dyn KvStore>, clock: Arc<ManualClock>) -> ResponseCache {
        let atomic = Arc::new(AtomicUpdater::new(
            store.clone(),
            clock.clone(),
            SessionConfig::default(),
            RateLimitConfig::default(),
            CleanupConfig::default(),
        ));
        let activity = Arc::new(ActivityTracker::new(store.clone(), clock.clone(), ActivityConfig::default()));
        ResponseCache::new(store, clock, atomic, activity, CacheConfig::default())
    }

    fn cache() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at_epoch_2026());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(clock.clone()));
        (cache_over(store, clock.clone()), clock)
    }

    #[test]
    fn test_key_is_deterministic_and_input_sensitive() {
        let a = derive_key("hello", "m1", "0.7");
        assert_eq!(a, derive_key("hello", "m1", "0.7"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, derive_key("hello", "m2", "0.7"));
        assert_ne!(a, derive_key("hello", "m1", "0.8"));
        assert_ne!(a, derive_key("hello!", "m1", "0.7"));
    }

    #[test]
    fn test_missing_temperature_uses_default_literal() {
        let (cache, _) = cache();
        assert_eq!(cache.cache_key("hi", "m1", None), cache.cache_key("hi", "m1", Some(0.7)));
        assert_eq!(format_temperature(1.0), "1.0");
        assert_eq!(format_temperature(0.25), "0.25");
    }

    #[tokio::test]
    async fn test_store_then_lookup_counts_hits() {
        let (cache, _) = cache();
        assert!(cache.lookup("hello", "m1", Some(0.7)).await.is_none());
        assert!(cache.store("s1", "hello", "Hi", "m1", Some(0.7)).await.unwrap());

        let first = cache.lookup("hello", "m1", Some(0.7)).await.unwrap();
        assert_eq!(first.response, "Hi");
        assert_eq!(first.hit_count, 1);
        let second = cache.lookup("hello", "m1", None).await.unwrap();
        assert_eq!(second.hit_count, 2);

        cache.record_request().await;
        let stats = cache.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.responses_cached, 1);
        assert_eq!(stats.hit_ratio, 66.67);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let (cache, clock) = cache();
        cache.store("s1", "hello", "Hi", "m1", None).await.unwrap();
        clock.advance(chrono::Duration::seconds(3601));
        assert!(cache.lookup("hello", "m1", None).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_stats_ratio_is_zero() {
        let (cache, _) = cache();
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_warm_does_not_overwrite_fresh_entry() {
        let (cache, _) = cache();
        assert!(cache.warm("s1", "q", "first", "m1", None).await.unwrap());
        assert!(!cache.warm("s1", "q", "second", "m1", None).await.unwrap());
        assert_eq!(cache.lookup("q", "m1", None).await.unwrap().response, "first");
        assert_eq!(cache.size().await, 1);

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_blank_model_is_rejected() {
        let (cache, _) = cache();
        assert!(matches!(
            cache.store("s1", "q", "a", " ", None).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_outage_is_a_miss() {
        let mut mock = MockKvStore::new();
        mock.expect_get()
            .returning(|_| Err(StoreError::Timeout { op: "GET" }));
        mock.expect_hincr_by()
            .returning(|_, _, _| Err(StoreError::Timeout { op: "HINCRBY" }));
        mock.expect_set()
            .returning(|_, _, _| Err(StoreError::Unavailable("down".into())));

        let cache = cache_over(Arc::new(mock), Arc::new(ManualClock::starting_at_epoch_2026()));
        assert!(cache.lookup("hello", "m1", None).await.is_none());
        assert!(!cache.store("s1", "hello", "Hi", "m1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let clock = Arc::new(ManualClock::starting_at_epoch_2026());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(clock.clone()));
        let cache = cache_over(store.clone(), clock);

        let key = keys::cached_response(&cache.cache_key("hello", "m1", None));
        store.set(&key, "not json", None).await.unwrap();
        assert!(cache.lookup("hello", "m1", None).await.is_none());
    }
}
