use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::keys;
use crate::config::ActivityConfig;
use crate::models::chat::{millis_to_datetime, MAX_SESSION_ID_CHARS, MAX_USER_ID_CHARS};
use crate::models::{ActivityScope, ActivitySummary, RankedEntry, SessionId, SweepReport};
use crate::store::{duration_millis, KvStore};
use crate::utils::error::validate_id;
use crate::utils::{Clock, ServiceResult, StoreResult};

/// Session and user liveness over two time-ordered rankings.
///
/// Scores are epoch millis and only ever move forward. Reads degrade to
/// "not live" / empty when the store is unreachable.
pub struct ActivityTracker {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: ActivityConfig,
}

impl ActivityTracker {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: ActivityConfig) -> Self {
        Self { store, clock, config }
    }

    fn live_cutoff(&self, now: i64) -> f64 {
        (now - secs_to_millis(self.config.live_window_secs)) as f64
    }

    fn stale_cutoff(&self, now: i64) -> f64 {
        (now - secs_to_millis(self.config.stale_after_secs)) as f64
    }

    /// Upsert the session and user rankings, refresh the liveness marker and
    /// owner entry, and enforce the per-user session cap. Returns the sessions evicted by the cap.
    pub async fn record_activity(&self, session_id: &str, user_id: &str) -> ServiceResult<Vec<SessionId>> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        validate_id("User ID", user_id, MAX_USER_ID_CHARS)?;

        let now = self.clock.now_millis();
        match self.upsert(session_id, user_id, now).await {
            Ok(()) => {}
            Err(e) => {
                warn!("Failed to record activity for session {}: {}", session_id, e);
                return Ok(Vec::new());
            }
        }

        match self.enforce_session_cap(user_id, now).await {
            Ok(evicted) => Ok(evicted),
            Err(e) => {
                warn!("Failed to enforce session cap for user {}: {}", user_id, e);
                Ok(Vec::new())
            }
        }
    }

    async fn upsert(&self, session_id: &str, user_id: &str, now: i64) -> StoreResult<()> {
        let score = now as f64;
        let user_sessions_key = keys::user_sessions(user_id);

        self.store.zadd_gt(keys::SESSION_RANKING, session_id, score).await?;
        self.store.zadd_gt(keys::USER_RANKING, user_id, score).await?;
        self.store
            .set(
                &keys::activity_marker(session_id),
                &now.to_string(),
                Some(Duration::from_secs(self.config.marker_ttl_secs.max(1))),
            )
            .await?;
        // outlives the ranking entry so a sweep can still find the user set
        self.store
            .set(
                &keys::session_owner(session_id),
                user_id,
                Some(Duration::from_secs(self.config.stale_after_secs.max(1).saturating_mul(2))),
            )
            .await?;

        self.store.zadd_gt(&user_sessions_key, session_id, score).await?;
        self.store
            .zrem_range_by_score(&user_sessions_key, f64::NEG_INFINITY, self.stale_cutoff(now) - 1.0)
            .await?;
        self.store
            .expire(&user_sessions_key, Duration::from_secs(self.config.stale_after_secs.max(1)))
            .await?;
        Ok(())
    }

    /// Evict the least recently active *inactive* sessions above the cap.
    /// Live sessions are never evicted, even if the cap stays exceeded.
    async fn enforce_session_cap(&self, user_id: &str, now: i64) -> StoreResult<Vec<SessionId>> {
        let user_sessions_key = keys::user_sessions(user_id);
        let tracked = self.store.zcard(&user_sessions_key).await? as usize;
        if tracked <= self.config.max_sessions_per_user {
            return Ok(Vec::new());
        }

        let live_cutoff = self.live_cutoff(now);
        let mut inactive: Vec<(String, f64)> = self
            .store
            .zrevrange_with_scores(&user_sessions_key, 0, -1)
            .await?
            .into_iter()
            .filter(|(_, score)| *score < live_cutoff)
            .collect();
        inactive.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let overflow = tracked - self.config.max_sessions_per_user;
        let mut evicted = Vec::new();
        for (session_id, _) in inactive.into_iter().take(overflow) {
            self.forget_entries(user_id, &session_id).await?;
            evicted.push(session_id);
        }

        if !evicted.is_empty() {
            info!("Evicted {} inactive sessions of user {}", evicted.len(), user_id);
        }
        Ok(evicted)
    }

    /// True when the session was active within the live window and still
    /// holds its liveness marker. Deactivation drops the marker.
    pub async fn is_live(&self, session_id: &str) -> bool {
        if session_id.trim().is_empty() {
            return false;
        }
        let now = self.clock.now_millis();
        let result = async {
            match self.store.zscore(keys::SESSION_RANKING, session_id).await? {
                Some(score) if score >= self.live_cutoff(now) => {
                    self.store.exists(&keys::activity_marker(session_id)).await
                }
                _ => StoreResult::Ok(false),
            }
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!("Liveness check for session {} failed: {}", session_id, e);
            false
        })
    }

    /// Marker value first, ranking score as fallback
    pub async fn last_activity(&self, session_id: &str) -> Option<DateTime<Utc>> {
        if session_id.trim().is_empty() {
            return None;
        }

        match self.store.get(&keys::activity_marker(session_id)).await {
            Ok(Some(raw)) => {
                if let Some(at) = raw.parse().ok().and_then(millis_to_datetime) {
                    return Some(at);
                }
                warn!("Corrupt activity marker for session {}: {}", session_id, raw);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Reading activity marker for session {} failed: {}", session_id, e);
                return None;
            }
        }

        match self.store.zscore(keys::SESSION_RANKING, session_id).await {
            Ok(score) => score.and_then(|s| millis_to_datetime(s as i64)),
            Err(e) => {
                warn!("Reading activity score for session {} failed: {}", session_id, e);
                None
            }
        }
    }

    /// Most recently active first
    pub async fn most_active(&self, scope: ActivityScope, limit: usize) -> Vec<RankedEntry> {
        if limit == 0 {
            return Vec::new();
        }
        let key = match scope {
            ActivityScope::Sessions => keys::SESSION_RANKING,
            ActivityScope::Users => keys::USER_RANKING,
        };
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        match self.store.zrevrange_with_scores(key, 0, stop).await {
            Ok(entries) => entries
                .into_iter()
                .map(|(id, last_activity)| RankedEntry { id, last_activity })
                .collect(),
            Err(e) => {
                warn!("Reading {:?} ranking failed: {}", scope, e);
                Vec::new()
            }
        }
    }

    /// Sessions active within the live window, oldest first
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let cutoff = self.live_cutoff(self.clock.now_millis());
        self.store
            .zrange_by_score(keys::SESSION_RANKING, cutoff, f64::INFINITY)
            .await
            .unwrap_or_else(|e| {
                warn!("Reading active sessions failed: {}", e);
                Vec::new()
            })
    }

    /// A user's tracked sessions, most recent first
    pub async fn user_sessions(&self, user_id: &str) -> Vec<RankedEntry> {
        if user_id.trim().is_empty() {
            return Vec::new();
        }
        let cutoff = self.stale_cutoff(self.clock.now_millis());
        match self.store.zrevrange_with_scores(&keys::user_sessions(user_id), 0, -1).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|(_, score)| *score >= cutoff)
                .map(|(id, last_activity)| RankedEntry { id, last_activity })
                .collect(),
            Err(e) => {
                warn!("Reading sessions of user {} failed: {}", user_id, e);
                Vec::new()
            }
        }
    }

    pub async fn summary(&self) -> ActivitySummary {
        let now = self.clock.now_millis();
        let since = |secs: u64| (now - secs_to_millis(secs)) as f64;

        let result = async {
            let total_sessions = self.store.zcard(keys::SESSION_RANKING).await?;
            let active_sessions = self
                .store
                .zcount(keys::SESSION_RANKING, since(self.config.live_window_secs), f64::INFINITY)
                .await?;
            let recent_sessions = self
                .store
                .zcount(keys::SESSION_RANKING, since(self.config.recent_window_secs), f64::INFINITY)
                .await?;
            let today_sessions = self
                .store
                .zcount(keys::SESSION_RANKING, since(self.config.today_window_secs), f64::INFINITY)
                .await?;
            StoreResult::Ok(ActivitySummary {
                total_sessions,
                active_sessions,
                recent_sessions,
                today_sessions,
            })
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!("Reading activity summary failed: {}", e);
            ActivitySummary::default()
        })
    }

    /// Remove every ranking entry older than `now - threshold` along with its
    /// liveness marker, its entry in the owner's session set, and the session
    /// sets of swept users. Safe to run next to `record_activity`: a concurrent
    /// upsert raises the score above the cutoff and the entry is left alone.
    pub async fn sweep_stale(&self, threshold: Duration) -> ServiceResult<SweepReport> {
        let now = self.clock.now_millis();
        let max = now.saturating_sub(duration_millis(threshold)) as f64 - 1.0;

        let stale_sessions = self
            .store
            .zrange_by_score(keys::SESSION_RANKING, f64::NEG_INFINITY, max)
            .await?;
        let stale_users = self
            .store
            .zrange_by_score(keys::USER_RANKING, f64::NEG_INFINITY, max)
            .await?;

        let mut report = SweepReport {
            sessions_removed: self
                .store
                .zrem_range_by_score(keys::SESSION_RANKING, f64::NEG_INFINITY, max)
                .await?,
            users_removed: self
                .store
                .zrem_range_by_score(keys::USER_RANKING, f64::NEG_INFINITY, max)
                .await?,
            markers_removed: 0,
        };

        for session_id in &stale_sessions {
            if self.store.zscore(keys::SESSION_RANKING, session_id).await?.is_some() {
                continue;
            }
            if self.store.del(&keys::activity_marker(session_id)).await? {
                report.markers_removed += 1;
            }
            let owner_key = keys::session_owner(session_id);
            if let Some(user_id) = self.store.get(&owner_key).await? {
                self.store.zrem(&keys::user_sessions(&user_id), session_id).await?;
                self.store.del(&owner_key).await?;
            }
        }

        // only stale members go, so a concurrent upsert into the set survives
        for user_id in &stale_users {
            if self.store.zscore(keys::USER_RANKING, user_id).await?.is_none() {
                self.store
                    .zrem_range_by_score(&keys::user_sessions(user_id), f64::NEG_INFINITY, max)
                    .await?;
            }
        }

        if report.sessions_removed > 0 || report.users_removed > 0 {
            info!(
                "Swept stale activity: {} sessions, {} users, {} markers",
                report.sessions_removed, report.users_removed, report.markers_removed
            );
        }
        Ok(report)
    }

    /// Drop the liveness marker so the session stops reporting live.
    /// The ranking score stays for `last_activity` and the sweep.
    pub async fn mark_inactive(&self, session_id: &str) {
        if let Err(e) = self.store.del(&keys::activity_marker(session_id)).await {
            warn!("Failed to drop activity marker of session {}: {}", session_id, e);
        }
    }

    /// Drop every tracking entry of a session
    pub async fn forget(&self, user_id: &str, session_id: &str) {
        match self.forget_entries(user_id, session_id).await {
            Ok(()) => debug!("Forgot session {} of user {}", session_id, user_id),
            Err(e) => warn!("Failed to forget session {}: {}", session_id, e),
        }
    }

    async fn forget_entries(&self, user_id: &str, session_id: &str) -> StoreResult<()> {
        self.store.zrem(&keys::user_sessions(user_id), session_id).await?;
        self.store.zrem(keys::SESSION_RANKING, session_id).await?;
        self.store.del(&keys::activity_marker(session_id)).await?;
        self.store.del(&keys::session_owner(session_id)).await?;
        Ok(())
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000) * 1000
}
