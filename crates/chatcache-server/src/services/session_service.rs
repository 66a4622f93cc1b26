use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::activity::ActivityTracker;
use super::atomic::AtomicUpdater;
use super::keys;
use super::message_service::MessageService;
use crate::config::SessionConfig;
use crate::models::chat::{fields, DEFAULT_SESSION_TITLE, MAX_SESSION_ID_CHARS, MAX_TITLE_CHARS, MAX_USER_ID_CHARS};
use crate::models::{ChatSession, SessionStats};
use crate::utils::error::validate_id;
use crate::store::KvStore;
use crate::utils::{Clock, ServiceError, ServiceResult};

/// Session lifecycle over the `session:{id}` hash
pub struct SessionService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    activity: Arc<ActivityTracker>,
    atomic: Arc<AtomicUpdater>,
    messages: Arc<MessageService>,
    config: SessionConfig,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        activity: Arc<ActivityTracker>,
        atomic: Arc<AtomicUpdater>,
        messages: Arc<MessageService>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            clock,
            activity,
            atomic,
            messages,
            config,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs.max(1))
    }

    pub async fn create_session(&self, user_id: &str, title: Option<&str>) -> ServiceResult<ChatSession> {
        validate_id("User ID", user_id, MAX_USER_ID_CHARS)?;
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_SESSION_TITLE,
        };
        validate_title(title)?;

        let session = ChatSession::new(user_id, title, self.clock.now());
        let key = keys::session(&session.id);
        self.store.hset_multiple(&key, &session.to_fields()).await?;
        self.store.expire(&key, self.ttl()).await?;

        self.track(&session).await?;
        info!("Created session {} for user {}", session.id, user_id);
        Ok(session)
    }

    /// `None` when missing or unreadable
    pub async fn get_session(&self, session_id: &str) -> ServiceResult<Option<ChatSession>> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        let map = self.store.hgetall(&keys::session(session_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }

        let session = ChatSession::from_fields(session_id, &map);
        if session.is_none() {
            warn!("Session {} has an unreadable hash, treating as missing", session_id);
        }
        Ok(session)
    }

    pub async fn get_session_or_err(&self, session_id: &str) -> ServiceResult<ChatSession> {
        self.get_session(session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Session not found: {}", session_id)))
    }

    /// Stamp activity on the hash, refresh its TTL and the liveness rankings
    pub async fn touch(&self, session_id: &str) -> ServiceResult<ChatSession> {
        let mut session = self.get_session_or_err(session_id).await?;
        session.last_activity = self.clock.now();

        let key = keys::session(session_id);
        self.store
            .hset_multiple(
                &key,
                &[(
                    fields::LAST_ACTIVITY.to_string(),
                    session.last_activity.timestamp_millis().to_string(),
                )],
            )
            .await?;
        self.store.expire(&key, self.ttl()).await?;

        self.track(&session).await?;
        Ok(session)
    }

    /// Soft delete: keep the data, drop liveness quickly
    pub async fn deactivate(&self, session_id: &str) -> ServiceResult<ChatSession> {
        let mut session = self.get_session_or_err(session_id).await?;
        session.active = false;
        self.write_field(session_id, fields::ACTIVE, "false").await?;
        self.activity.mark_inactive(session_id).await;
        debug!("Deactivated session {}", session_id);
        Ok(session)
    }

    pub async fn reactivate(&self, session_id: &str) -> ServiceResult<ChatSession> {
        self.get_session_or_err(session_id).await?;
        self.write_field(session_id, fields::ACTIVE, "true").await?;
        self.touch(session_id).await
    }

    pub async fn update_title(&self, session_id: &str, title: &str) -> ServiceResult<ChatSession> {
        validate_title(title)?;
        let mut session = self.get_session_or_err(session_id).await?;
        session.title = title.to_string();
        self.write_field(session_id, fields::TITLE, title).await?;
        Ok(session)
    }

    pub async fn set_setting(&self, session_id: &str, name: &str, value: Value) -> ServiceResult<ChatSession> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("Setting name cannot be empty".to_string()));
        }
        let mut session = self.get_session_or_err(session_id).await?;
        session.settings.insert(name.to_string(), value);
        let encoded = serde_json::to_string(&session.settings)?;
        self.write_field(session_id, fields::SETTINGS, &encoded).await?;
        Ok(session)
    }

    pub async fn get_setting(&self, session_id: &str, name: &str) -> ServiceResult<Option<Value>> {
        let session = self.get_session_or_err(session_id).await?;
        Ok(session.settings.get(name).cloned())
    }

    /// Add usage outside the message path (e.g. generation tokens).
    /// Returns the new message count.
    pub async fn record_usage(&self, session_id: &str, message_delta: i64, token_delta: i64) -> ServiceResult<i64> {
        self.get_session_or_err(session_id).await?;
        self.atomic
            .bump_session_counters(session_id, message_delta, token_delta)
            .await
    }

    pub async fn stats(&self, session_id: &str) -> ServiceResult<SessionStats> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        self.atomic.session_stats(session_id).await
    }

    /// Hard delete: hash, messages and every tracking entry.
    /// Returns false when the session did not exist.
    pub async fn delete_session(&self, session_id: &str) -> ServiceResult<bool> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(false);
        };
        self.purge(&session.user_id, session_id).await?;
        info!("Deleted session {}", session_id);
        Ok(true)
    }

    /// The user's tracked sessions, most recent first. Entries whose hash is
    /// gone are dropped from tracking.
    pub async fn user_sessions(&self, user_id: &str) -> ServiceResult<Vec<ChatSession>> {
        validate_id("User ID", user_id, MAX_USER_ID_CHARS)?;
        let mut sessions = Vec::new();
        for entry in self.activity.user_sessions(user_id).await {
            match self.get_session(&entry.id).await? {
                Some(session) => sessions.push(session),
                None => self.activity.forget(user_id, &entry.id).await,
            }
        }
        Ok(sessions)
    }

    pub async fn active_user_sessions(&self, user_id: &str) -> ServiceResult<Vec<ChatSession>> {
        Ok(self
            .user_sessions(user_id)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    async fn track(&self, session: &ChatSession) -> ServiceResult<()> {
        let evicted = self.activity.record_activity(&session.id, &session.user_id).await?;
        for session_id in evicted {
            if let Err(e) = self.purge(&session.user_id, &session_id).await {
                warn!("Failed to delete evicted session {}: {}", session_id, e);
            }
        }
        Ok(())
    }

    async fn purge(&self, user_id: &str, session_id: &str) -> ServiceResult<()> {
        self.messages.delete_session_messages(session_id).await?;
        self.store.del(&keys::session(session_id)).await?;
        self.activity.forget(user_id, session_id).await;
        Ok(())
    }

    async fn write_field(&self, session_id: &str, field: &str, value: &str) -> ServiceResult<()> {
        self.store
            .hset_multiple(&keys::session(session_id), &[(field.to_string(), value.to_string())])
            .await?;
        Ok(())
    }
}

fn validate_title(title: &str) -> ServiceResult<()> {
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ServiceError::Validation(format!(
            "Session title cannot exceed {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActivityConfig, CleanupConfig, RateLimitConfig};
    use crate::models::MessageRole;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;

    struct Fixture {
        sessions: SessionService,
        messages: Arc<MessageService>,
        activity: Arc<ActivityTracker>,
        store: Arc<dyn KvStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_at_epoch_2026());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(clock.clone()));
        let config = SessionConfig::default();
        let atomic = Arc::new(AtomicUpdater::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            RateLimitConfig::default(),
            CleanupConfig::default(),
        ));
        let activity = Arc::new(ActivityTracker::new(store.clone(), clock.clone(), ActivityConfig::default()));
        let messages = Arc::new(MessageService::new(store.clone(), clock.clone(), atomic.clone(), config.clone()));
        let sessions = SessionService::new(
            store.clone(),
            clock.clone(),
            activity.clone(),
            atomic,
            messages.clone(),
            config,
        );
        Fixture {
            sessions,
            messages,
            activity,
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let f = fixture();
        let session = f.sessions.create_session("u1", None).await.unwrap();
        assert_eq!(session.title, DEFAULT_SESSION_TITLE);
        assert!(f.activity.is_live(&session.id).await);

        let loaded = f.sessions.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert!(loaded.active);
        assert!(f.sessions.get_session("session_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let f = fixture();
        assert!(f.sessions.create_session("", None).await.is_err());
        let long_title = "t".repeat(MAX_TITLE_CHARS + 1);
        assert!(f.sessions.create_session("u1", Some(&long_title)).await.is_err());
    }

    #[tokio::test]
    async fn test_deactivate_and_reactivate() {
        let f = fixture();
        let session = f.sessions.create_session("u1", Some("Trip")).await.unwrap();

        let inactive = f.sessions.deactivate(&session.id).await.unwrap();
        assert!(!inactive.active);
        assert!(!f.sessions.get_session(&session.id).await.unwrap().unwrap().active);
        assert!(!f.activity.is_live(&session.id).await);

        f.clock.advance(chrono::Duration::minutes(10));
        let active = f.sessions.reactivate(&session.id).await.unwrap();
        assert!(active.active);
        assert_eq!(active.last_activity, f.clock.now());
        assert!(f.activity.is_live(&session.id).await);
    }

    #[tokio::test]
    async fn test_settings_and_title() {
        let f = fixture();
        let session = f.sessions.create_session("u1", None).await.unwrap();
        f.sessions
            .set_setting(&session.id, "model", Value::String("m1".into()))
            .await
            .unwrap();
        f.sessions.update_title(&session.id, "Renamed").await.unwrap();

        let loaded = f.sessions.get_session_or_err(&session.id).await.unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(
            f.sessions.get_setting(&session.id, "model").await.unwrap(),
            Some(Value::String("m1".into()))
        );
    }

    #[tokio::test]
    async fn test_counters_follow_messages_and_usage() {
        let f = fixture();
        let session = f.sessions.create_session("u1", None).await.unwrap();
        let message = f
            .messages
            .add_message(&session.id, MessageRole::User, "hello world")
            .await
            .unwrap();
        f.sessions.record_usage(&session.id, 0, 5).await.unwrap();

        let stats = f.sessions.stats(&session.id).await.unwrap();
        assert_eq!(stats.message_count, 1);
        assert_eq!(stats.token_count, message.token_count.unwrap_or(0) as u64 + 5);
        assert_eq!(stats.message_list_length, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let f = fixture();
        let session = f.sessions.create_session("u1", None).await.unwrap();
        f.messages
            .add_message(&session.id, MessageRole::User, "hello")
            .await
            .unwrap();

        assert!(f.sessions.delete_session(&session.id).await.unwrap());
        assert!(!f.sessions.delete_session(&session.id).await.unwrap());
        assert!(!f.activity.is_live(&session.id).await);
        assert!(f.store.keys("*message*").await.unwrap().is_empty());
        assert!(f.sessions.user_sessions("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cap_eviction_hard_deletes_session() {
        let f = fixture();
        let first = f.sessions.create_session("u1", None).await.unwrap();
        for _ in 0..9 {
            f.clock.advance(chrono::Duration::minutes(1));
            f.sessions.create_session("u1", None).await.unwrap();
        }
        f.clock.advance(chrono::Duration::hours(1));
        f.sessions.create_session("u1", None).await.unwrap();

        assert!(f.sessions.get_session(&first.id).await.unwrap().is_none());
        assert_eq!(f.sessions.user_sessions("u1").await.unwrap().len(), 10);
    }
}
