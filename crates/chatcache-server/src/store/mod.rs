//! Remote key-value store contract and its two backends.
//!
//! Services only talk to [`KvStore`]. The backend is chosen once at
//! construction: [`RedisStore`] in production, [`MemoryStore`] when redis is
//! absent or in tests. Calls are never routed to both.

mod memory;
mod redis_store;
pub mod scripts;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use scripts::{ReplyShape, ScriptCall, ScriptKind, ScriptReply};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{StoreBackend, StoreConfig};
use crate::utils::{Clock, StoreResult};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    // ===== STRINGS / KEYSPACE =====

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value; `ttl = None` clears any previous expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Glob match over the keyspace. Only for bounded maintenance paths.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    // ===== HASHES =====

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    // ===== SORTED SETS =====

    /// Upsert a member; an existing score is only ever raised
    async fn zadd_gt(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Highest scores first, inclusive rank range (negative ranks count from the end)
    async fn zrevrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>>;

    /// Members with `min <= score <= max`, lowest first
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    // ===== LISTS =====

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    // ===== SCRIPTS =====

    /// Run one script as a single indivisible step
    async fn run_script(&self, call: &ScriptCall) -> StoreResult<ScriptReply>;
}

/// Build the configured backend, falling back to memory when allowed
pub async fn connect(cfg: &StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<Arc<dyn KvStore>> {
    match cfg.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store backend");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        StoreBackend::Redis => match RedisStore::connect(cfg).await {
            Ok(store) => {
                info!("Connected to redis at {}", cfg.url);
                Ok(Arc::new(store))
            }
            Err(e) if cfg.fallback_to_memory => {
                warn!("Redis unreachable ({}), falling back to in-memory store", e);
                Ok(Arc::new(MemoryStore::new(clock)))
            }
            Err(e) => Err(e),
        },
    }
}

/// Render a score bound the way redis expects it
pub(crate) fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// Milliseconds as a signed count, saturating instead of wrapping
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Whole seconds for EXPIRE-style arguments, never below 1
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SystemClock;

    #[test]
    fn test_score_arg() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(1500.0), "1500");
    }

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let cfg = StoreConfig {
            backend: StoreBackend::Memory,
            ..StoreConfig::default()
        };
        let store = connect(&cfg, Arc::new(SystemClock)).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_connect_falls_back_when_redis_unreachable() {
        let cfg = StoreConfig {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            fallback_to_memory: true,
            ..StoreConfig::default()
        };
        let store = connect(&cfg, Arc::new(SystemClock)).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
    }
}
