use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::atomic::AtomicUpdater;
use super::keys;
use crate::config::SessionConfig;
use crate::models::chat::{MAX_MESSAGE_CHARS, MAX_SESSION_ID_CHARS};
use crate::models::{ChatMessage, MessageRole};
use crate::store::KvStore;
use crate::utils::error::validate_id;
use crate::utils::token_estimator::estimate_message_tokens;
use crate::utils::{Clock, ServiceError, ServiceResult};

const DEFAULT_RECENT_LIMIT: usize = 10;
const MAX_PAGE_SIZE: usize = 100;

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid script tag regex"));
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid html tag regex"));

/// Strip script blocks and markup from user supplied text
pub fn sanitize_content(content: &str) -> String {
    let without_scripts = SCRIPT_TAG.replace_all(content, "");
    HTML_TAG.replace_all(&without_scripts, "").trim().to_string()
}

/// Message records plus the per-session ordered id list
pub struct MessageService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    atomic: Arc<AtomicUpdater>,
    config: SessionConfig,
}

impl MessageService {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, atomic: Arc<AtomicUpdater>, config: SessionConfig) -> Self {
        Self {
            store,
            clock,
            atomic,
            config,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs.max(1))
    }

    /// Validate, sanitize and persist a message, then append it to the session
    /// in one atomic step. The record is removed again if the append fails.
    pub async fn add_message(&self, session_id: &str, role: MessageRole, content: &str) -> ServiceResult<ChatMessage> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        if content.trim().is_empty() {
            return Err(ServiceError::Validation("Message content cannot be null or empty".to_string()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ServiceError::Validation(format!(
                "Message content cannot exceed {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let content = sanitize_content(content);
        if content.is_empty() {
            return Err(ServiceError::Validation("Message content is empty after sanitizing".to_string()));
        }

        if !self.store.exists(&keys::session(session_id)).await? {
            return Err(ServiceError::NotFound(format!("Session not found: {}", session_id)));
        }

        let mut message = ChatMessage::new(session_id, role, content);
        message.created_at = self.clock.now();
        let tokens = estimate_message_tokens(&message);
        message.token_count = Some(tokens);

        let record_key = keys::message(&message.id);
        let json = serde_json::to_string(&message)?;
        self.store.set(&record_key, &json, Some(self.ttl())).await?;

        if let Err(e) = self.atomic.append_message(session_id, &message.id, tokens as i64).await {
            warn!("Appending message {} to session {} failed: {}", message.id, session_id, e);
            if let Err(cleanup) = self.store.del(&record_key).await {
                warn!("Failed to remove orphaned message {}: {}", message.id, cleanup);
            }
            return Err(e);
        }

        debug!(
            "Added {} message {} to session {} ({} tokens)",
            role.as_str(),
            message.id,
            session_id,
            tokens
        );
        Ok(message)
    }

    /// Newest `limit` messages in chronological order. Out-of-range limits
    /// fall back to 10.
    pub async fn recent_messages(&self, session_id: &str, limit: usize) -> ServiceResult<Vec<ChatMessage>> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        let limit = if limit == 0 || limit > self.config.max_messages {
            DEFAULT_RECENT_LIMIT
        } else {
            limit
        };
        let start = -isize::try_from(limit).unwrap_or(DEFAULT_RECENT_LIMIT as isize);
        let ids = self.store.lrange(&keys::messages(session_id), start, -1).await?;
        Ok(self.load_all(&ids).await)
    }

    pub async fn all_messages(&self, session_id: &str) -> ServiceResult<Vec<ChatMessage>> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        let ids = self.store.lrange(&keys::messages(session_id), 0, -1).await?;
        Ok(self.load_all(&ids).await)
    }

    /// Zero-based page of the retained history, oldest first
    pub async fn messages_page(&self, session_id: &str, page: usize, size: usize) -> ServiceResult<Vec<ChatMessage>> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(ServiceError::Validation(format!(
                "Page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let start = page.saturating_mul(size);
        let (Ok(start), Ok(stop)) = (isize::try_from(start), isize::try_from(start + size - 1)) else {
            return Ok(Vec::new());
        };
        let ids = self.store.lrange(&keys::messages(session_id), start, stop).await?;
        Ok(self.load_all(&ids).await)
    }

    /// Length of the retained id list
    pub async fn message_count(&self, session_id: &str) -> ServiceResult<u64> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        Ok(self.store.llen(&keys::messages(session_id)).await?)
    }

    /// Remove every message record of the session and its id list.
    /// Returns the number of records deleted.
    pub async fn delete_session_messages(&self, session_id: &str) -> ServiceResult<u64> {
        validate_id("Session ID", session_id, MAX_SESSION_ID_CHARS)?;
        let list_key = keys::messages(session_id);
        let ids = self.store.lrange(&list_key, 0, -1).await?;

        let mut deleted = 0;
        for id in &ids {
            if self.store.del(&keys::message(id)).await? {
                deleted += 1;
            }
        }
        self.store.del(&list_key).await?;
        Ok(deleted)
    }

    /// Missing or unreadable records are skipped
    async fn load_all(&self, ids: &[String]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get(&keys::message(id)).await {
                Ok(Some(raw)) => match serde_json::from_str::<ChatMessage>(&raw) {
                    Ok(message) => messages.push(message),
                    Err(e) => warn!("Skipping corrupt message {}: {}", id, e),
                },
                Ok(None) => debug!("Message {} expired or missing", id),
                Err(e) => warn!("Loading message {} failed: {}", id, e),
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanupConfig, RateLimitConfig};
    use crate::models::chat::fields;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;

    fn service() -> (MessageService, Arc<dyn KvStore>) {
        let clock = Arc::new(ManualClock::starting_at_epoch_2026());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(clock.clone()));
        let config = SessionConfig {
            max_messages: 5,
            ..SessionConfig::default()
        };
        let atomic = Arc::new(AtomicUpdater::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            RateLimitConfig::default(),
            CleanupConfig::default(),
        ));
        (MessageService::new(store.clone(), clock, atomic, config), store)
    }

    async fn seed_session(store: &Arc<dyn KvStore>, id: &str) {
        store
            .hset_multiple(
                &keys::session(id),
                &[(fields::USER_ID.to_string(), "u1".to_string())],
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_sanitize_strips_markup() {
        assert_eq!(
            sanitize_content("hi <script>alert(1)</script><b>there</b>"),
            "hi there"
        );
        assert_eq!(sanitize_content("plain text"), "plain text");
    }

    #[tokio::test]
    async fn test_add_message_updates_session_counters() {
        let (service, store) = service();
        seed_session(&store, "s1").await;

        let message = service.add_message("s1", MessageRole::User, "Hello there").await.unwrap();
        assert_eq!(message.token_count, Some(estimate_message_tokens(&message)));

        let session = store.hgetall(&keys::session("s1")).await.unwrap();
        assert_eq!(session.get(fields::MESSAGE_COUNT).map(String::as_str), Some("1"));
        assert_eq!(
            session.get(fields::TOKEN_COUNT).cloned(),
            message.token_count.map(|t| t.to_string())
        );
    }

    #[tokio::test]
    async fn test_add_message_validates_input() {
        let (service, store) = service();
        seed_session(&store, "s1").await;

        assert!(matches!(
            service.add_message("s1", MessageRole::User, "   ").await,
            Err(ServiceError::Validation(_))
        ));
        let too_long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            service.add_message("s1", MessageRole::User, &too_long).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            service.add_message("missing", MessageRole::User, "hi").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_ordered() {
        let (service, store) = service();
        seed_session(&store, "s1").await;
        for i in 0..7 {
            service
                .add_message("s1", MessageRole::User, &format!("message {}", i))
                .await
                .unwrap();
        }

        let all = service.all_messages("s1").await.unwrap();
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4", "message 5", "message 6"]);

        let recent = service.recent_messages("s1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].content, "message 6");

        let page = service.messages_page("s1", 1, 2).await.unwrap();
        assert_eq!(page[0].content, "message 4");
        assert!(service.messages_page("s1", 0, 0).await.is_err());

        assert_eq!(service.message_count("s1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_corrupt_records_are_skipped() {
        let (service, store) = service();
        seed_session(&store, "s1").await;
        let kept = service.add_message("s1", MessageRole::User, "one").await.unwrap();
        let broken = service.add_message("s1", MessageRole::User, "two").await.unwrap();
        store.set(&keys::message(&broken.id), "{oops", None).await.unwrap();

        let all = service.all_messages("s1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_delete_session_messages() {
        let (service, store) = service();
        seed_session(&store, "s1").await;
        service.add_message("s1", MessageRole::User, "one").await.unwrap();
        service.add_message("s1", MessageRole::Assistant, "two").await.unwrap();

        assert_eq!(service.delete_session_messages("s1").await.unwrap(), 2);
        assert_eq!(service.message_count("s1").await.unwrap(), 0);
        assert!(store.keys("message:*").await.unwrap().is_empty());
    }
}
