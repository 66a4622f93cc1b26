use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::store::KvStore;

/// Failed pings in a row before the store is reported unhealthy
const FAILURES_BEFORE_UNHEALTHY: u64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub backend: &'static str,
    pub reachable: bool,
    pub healthy: bool,
    pub latency_ms: u64,
    pub consecutive_failures: u64,
    pub error: Option<String>,
}

/// Ping-based store health with failure hysteresis
pub struct StoreHealth {
    store: Arc<dyn KvStore>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU64,
}

impl StoreHealth {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    pub async fn check(&self) -> HealthReport {
        let start = Instant::now();
        let result = self.store.ping().await;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error = match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if !self.healthy.swap(true, Ordering::Relaxed) {
                    info!("Store connection restored ({})", self.store.backend_name());
                }
                None
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= FAILURES_BEFORE_UNHEALTHY && self.healthy.swap(false, Ordering::Relaxed) {
                    warn!("Store marked unhealthy after {} failed pings: {}", failures, e);
                }
                Some(e.to_string())
            }
        };

        HealthReport {
            backend: self.store.backend_name(),
            reachable: error.is_none(),
            healthy: self.is_healthy(),
            latency_ms,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            error,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockKvStore};
    use crate::utils::{StoreError, SystemClock};

    #[tokio::test]
    async fn test_memory_backend_is_healthy() {
        let health = StoreHealth::new(Arc::new(MemoryStore::new(Arc::new(SystemClock))));
        let report = health.check().await;
        assert_eq!(report.backend, "memory");
        assert!(report.reachable);
        assert!(report.healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_after_repeated_failures() {
        let mut mock = MockKvStore::new();
        mock.expect_backend_name().return_const("redis");
        mock.expect_ping()
            .returning(|| Err(StoreError::Timeout { op: "PING" }));
        let health = StoreHealth::new(Arc::new(mock));

        for _ in 0..2 {
            let report = health.check().await;
            assert!(!report.reachable);
            assert!(report.healthy);
        }
        let report = health.check().await;
        assert!(!report.healthy);
        assert_eq!(report.consecutive_failures, 3);
    }
}
