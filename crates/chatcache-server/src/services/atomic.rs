use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::keys;
use crate::config::{CleanupConfig, RateLimitConfig, SessionConfig};
use crate::models::chat::millis_to_datetime;
use crate::models::SessionStats;
use crate::store::{duration_millis, KvStore, ScriptCall, ScriptKind, ScriptReply};
use crate::utils::{Clock, ServiceResult, StoreError};

/// Admission decision of the sliding-window limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Zero when admitted
    pub retry_after: Duration,
}

impl RateLimitDecision {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining: 0,
            retry_after: Duration::ZERO,
        }
    }
}

/// Multi-step state transitions, each executed as one server-side script.
///
/// A failed script is treated as "nothing happened": callers may re-issue it.
pub struct AtomicUpdater {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    session: SessionConfig,
    rate_limit: RateLimitConfig,
    cleanup: CleanupConfig,
}

impl AtomicUpdater {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        session: SessionConfig,
        rate_limit: RateLimitConfig,
        cleanup: CleanupConfig,
    ) -> Self {
        Self {
            store,
            clock,
            session,
            rate_limit,
            cleanup,
        }
    }

    // ===== SESSION COUNTERS =====

    /// Add to the session counters, stamp last activity and refresh the TTL.
    /// Returns the new message count.
    pub async fn bump_session_counters(&self, session_id: &str, message_delta: i64, token_delta: i64) -> ServiceResult<i64> {
        let call = ScriptCall::new(ScriptKind::SessionCounters)
            .key(keys::session(session_id))
            .arg(message_delta)
            .arg(token_delta)
            .arg(self.clock.now_millis())
            .arg(self.session.ttl_secs);

        let count = expect_int(self.store.run_script(&call).await?, ScriptKind::SessionCounters)?;
        debug!("Session {} counters bumped, message_count={}", session_id, count);
        Ok(count)
    }

    /// Append a message id, trim the list to `max_messages`, bump counters and
    /// refresh both TTLs. Returns the list length.
    pub async fn append_message(&self, session_id: &str, message_id: &str, token_delta: i64) -> ServiceResult<u64> {
        let call = ScriptCall::new(ScriptKind::MessageAppend)
            .key(keys::messages(session_id))
            .key(keys::session(session_id))
            .arg(message_id)
            .arg(self.session.max_messages.max(1))
            .arg(self.session.ttl_secs)
            .arg(self.clock.now_millis())
            .arg(token_delta);

        let len = expect_int(self.store.run_script(&call).await?, ScriptKind::MessageAppend)?;
        Ok(len.max(0) as u64)
    }

    // ===== RATE LIMITING =====

    /// Sliding-window admission for one subject key.
    /// Any store failure admits the request.
    pub async fn check_rate_limit(&self, key: &str, window: Duration, limit: u64) -> RateLimitDecision {
        let now = self.clock.now_millis();
        let nonce: u32 = rand::rng().random();
        let call = ScriptCall::new(ScriptKind::SlidingWindow)
            .key(key)
            .arg(duration_millis(window))
            .arg(limit)
            .arg(now)
            .arg(format!("{}-{:08x}", now, nonce));

        let reply = match self.store.run_script(&call).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Rate limit check for {} failed, admitting: {}", key, e);
                return RateLimitDecision::fail_open();
            }
        };

        match reply.as_ints() {
            Some([admitted, remaining, retry_after_ms, ..]) => RateLimitDecision {
                allowed: *admitted == 1,
                remaining: (*remaining).max(0) as u64,
                retry_after: Duration::from_millis((*retry_after_ms).max(0) as u64),
            },
            _ => {
                warn!("Rate limit check for {} returned {:?}, admitting", key, reply);
                RateLimitDecision::fail_open()
            }
        }
    }

    pub async fn check_user_rate_limit(&self, user_id: &str) -> RateLimitDecision {
        self.check_rate_limit(&keys::user_rate_limit(user_id), self.rate_limit_window(), self.rate_limit.user_limit)
            .await
    }

    pub async fn check_session_rate_limit(&self, session_id: &str) -> RateLimitDecision {
        self.check_rate_limit(
            &keys::session_rate_limit(session_id),
            self.rate_limit_window(),
            self.rate_limit.session_limit,
        )
        .await
    }

    pub async fn is_user_rate_limited(&self, user_id: &str) -> bool {
        !self.check_user_rate_limit(user_id).await.allowed
    }

    pub async fn is_session_rate_limited(&self, session_id: &str) -> bool {
        !self.check_session_rate_limit(session_id).await.allowed
    }

    fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs.max(1))
    }

    // ===== CONDITIONAL WRITE =====

    /// Write only when the key is missing or has less than half of `ttl` left.
    /// Returns whether the write happened.
    pub async fn set_if_stale(&self, key: &str, value: &str, ttl: Duration) -> ServiceResult<bool> {
        let call = ScriptCall::new(ScriptKind::SetIfStale)
            .key(key)
            .arg(value)
            .arg(ttl.as_secs().max(1));
        let written = expect_int(self.store.run_script(&call).await?, ScriptKind::SetIfStale)?;
        Ok(written == 1)
    }

    // ===== BOUNDED CLEANUP =====

    /// Delete sessions whose `last_activity` is older than `max_age`, visiting
    /// at most one batch of keys. Each removal takes the message list, the
    /// message records, the marker and both ranking entries with it.
    pub async fn cleanup_idle_sessions(&self, max_age: Duration) -> ServiceResult<u64> {
        let call = ScriptCall::new(ScriptKind::CleanupIdle)
            .key(keys::SESSION_RANKING)
            .arg(keys::SESSION_PREFIX)
            .arg(duration_millis(max_age))
            .arg(self.clock.now_millis())
            .arg(self.cleanup.batch_size)
            .arg(keys::MESSAGES_PREFIX)
            .arg(keys::MESSAGE_PREFIX)
            .arg(keys::MARKER_PREFIX)
            .arg(keys::USER_SESSIONS_PREFIX)
            .arg(keys::OWNER_PREFIX);
        let deleted = expect_int(self.store.run_script(&call).await?, ScriptKind::CleanupIdle)?;
        if deleted > 0 {
            debug!("Cleaned up {} idle sessions", deleted);
        }
        Ok(deleted.max(0) as u64)
    }

    /// Delete at most one batch of keys matching `pattern`
    pub async fn bulk_delete(&self, pattern: &str) -> ServiceResult<u64> {
        let call = ScriptCall::new(ScriptKind::BulkDelete)
            .arg(pattern)
            .arg(self.cleanup.batch_size);
        let deleted = expect_int(self.store.run_script(&call).await?, ScriptKind::BulkDelete)?;
        Ok(deleted.max(0) as u64)
    }

    pub async fn delete_all_sessions(&self) -> ServiceResult<u64> {
        self.bulk_delete(&keys::all_under(keys::SESSION_PREFIX)).await
    }

    /// Message id lists first, then the records they point to
    pub async fn delete_all_messages(&self) -> ServiceResult<u64> {
        let lists = self.bulk_delete(&keys::all_under(keys::MESSAGES_PREFIX)).await?;
        let records = self.bulk_delete(&keys::all_under(keys::MESSAGE_PREFIX)).await?;
        Ok(lists + records)
    }

    pub async fn delete_all_cache_entries(&self) -> ServiceResult<u64> {
        self.bulk_delete("cache:*").await
    }

    // ===== STATISTICS =====

    /// Point-in-time snapshot of a session hash and its message list
    pub async fn session_stats(&self, session_id: &str) -> ServiceResult<SessionStats> {
        let call = ScriptCall::new(ScriptKind::SessionSnapshot)
            .key(keys::session(session_id))
            .key(keys::messages(session_id));

        let reply = self.store.run_script(&call).await?;
        let pairs = reply.as_strings().ok_or_else(|| unexpected_reply(ScriptKind::SessionSnapshot, &reply))?;

        let map: HashMap<&str, &str> = pairs
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
            .collect();

        let int = |field: &str, default: i64| -> i64 {
            map.get(field).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let time = |field: &str| map.get(field).and_then(|v| v.parse().ok()).and_then(millis_to_datetime);

        Ok(SessionStats {
            message_count: int("message_count", 0).max(0) as u64,
            token_count: int("token_count", 0).max(0) as u64,
            last_activity: time("last_activity"),
            created_at: time("created_at"),
            active: map.get("active").map(|v| *v != "false").unwrap_or(true),
            message_list_length: int("message_list_length", 0).max(0) as u64,
            session_ttl: int("session_ttl", -2),
            message_list_ttl: int("message_list_ttl", -2),
        })
    }
}

fn expect_int(reply: ScriptReply, kind: ScriptKind) -> ServiceResult<i64> {
    reply.as_int().ok_or_else(|| unexpected_reply(kind, &reply).into())
}

fn unexpected_reply(kind: ScriptKind, reply: &ScriptReply) -> StoreError {
    StoreError::Script {
        script: kind.name(),
        reason: format!("unexpected reply {:?}", reply),
    }
}
