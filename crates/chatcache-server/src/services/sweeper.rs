use serde::Serialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error};

use super::activity::ActivityTracker;
use super::atomic::AtomicUpdater;
use super::event_log::EventLog;
use crate::config::{ActivityConfig, CleanupConfig};
use crate::models::SweepReport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub activity: SweepReport,
    pub idle_sessions_removed: u64,
}

/// Periodic maintenance: stale ranking entries and idle session records
pub struct ActivitySweeper {
    activity: Arc<ActivityTracker>,
    atomic: Arc<AtomicUpdater>,
    events: Arc<EventLog>,
    config: ActivityConfig,
    cleanup: CleanupConfig,
}

impl ActivitySweeper {
    pub fn new(
        activity: Arc<ActivityTracker>,
        atomic: Arc<AtomicUpdater>,
        events: Arc<EventLog>,
        config: ActivityConfig,
        cleanup: CleanupConfig,
    ) -> Self {
        Self {
            activity,
            atomic,
            events,
            config,
            cleanup,
        }
    }

    /// One maintenance pass. Failures are logged and the pass continues.
    pub async fn run_once(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        match self
            .activity
            .sweep_stale(Duration::from_secs(self.config.stale_after_secs))
            .await
        {
            Ok(report) => outcome.activity = report,
            Err(e) => error!("Activity sweep failed: {}", e),
        }

        match self
            .atomic
            .cleanup_idle_sessions(Duration::from_secs(self.cleanup.idle_session_secs))
            .await
        {
            Ok(removed) => outcome.idle_sessions_removed = removed,
            Err(e) => error!("Idle session cleanup failed: {}", e),
        }

        if outcome != SweepOutcome::default() {
            self.events
                .publish_system_event(
                    "sweep",
                    "stale activity and idle sessions removed",
                    serde_json::to_value(&outcome).unwrap_or_default(),
                )
                .await;
        }
        debug!("Sweep pass finished: {:?}", outcome);
        outcome
    }

    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        loop {
            sleep(period).await;
            self.run_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventLogConfig, RateLimitConfig, SessionConfig};
    use crate::services::keys;
    use crate::store::{KvStore, MemoryStore};
    use crate::utils::ManualClock;

    #[tokio::test]
    async fn test_run_once_removes_stale_entries() {
        let clock = Arc::new(ManualClock::starting_at_epoch_2026());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(clock.clone()));
        let config = ActivityConfig::default();
        let activity = Arc::new(ActivityTracker::new(store.clone(), clock.clone(), config.clone()));
        let atomic = Arc::new(AtomicUpdater::new(
            store.clone(),
            clock.clone(),
            SessionConfig::default(),
            RateLimitConfig::default(),
            CleanupConfig::default(),
        ));

        activity.record_activity("old", "u1").await.unwrap();
        clock.advance(chrono::Duration::seconds(config.stale_after_secs as i64 + 60));
        activity.record_activity("fresh", "u2").await.unwrap();

        let events = Arc::new(EventLog::new(store.clone(), clock.clone(), EventLogConfig::default()));
        let sweeper = ActivitySweeper::new(activity, atomic, events.clone(), config, CleanupConfig::default());
        let outcome = sweeper.run_once().await;

        assert_eq!(outcome.activity.sessions_removed, 1);
        assert_eq!(outcome.activity.users_removed, 1);
        assert!(store.zscore(keys::SESSION_RANKING, "old").await.unwrap().is_none());
        assert!(store.zscore(keys::SESSION_RANKING, "fresh").await.unwrap().is_some());

        let logged = events.read_system_events(10).await;
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind, "sweep");
        assert_eq!(logged[0].detail["activity"]["sessions_removed"], 1);

        // nothing left to remove, nothing logged
        sweeper.run_once().await;
        assert_eq!(events.read_system_events(10).await.len(), 1);
    }
}
