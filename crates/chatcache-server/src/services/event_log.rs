use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::keys;
use crate::config::EventLogConfig;
use crate::models::{ChatMessage, EventRecord, EventStream, SessionId};
use crate::store::{KvStore, ScriptCall, ScriptKind};
use crate::utils::Clock;

/// Bounded append-only logs of chat messages, session and user activity,
/// and system events.
///
/// Logging is best-effort: write failures are logged and dropped, reads
/// degrade to empty.
pub struct EventLog {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: EventLogConfig,
}

impl EventLog {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: EventLogConfig) -> Self {
        Self { store, clock, config }
    }

    fn key(stream: &EventStream) -> String {
        match stream {
            EventStream::Chat(session_id) => keys::chat_stream(session_id),
            EventStream::SessionActivity => keys::SESSION_EVENTS.to_string(),
            EventStream::UserActivity => keys::USER_EVENTS.to_string(),
            EventStream::System => keys::SYSTEM_EVENTS.to_string(),
        }
    }

    /// Entry cap of a stream, never below 1
    pub fn cap(&self, stream: &EventStream) -> usize {
        let cap = match stream {
            EventStream::Chat(_) => self.config.chat_stream_cap,
            EventStream::SessionActivity => self.config.session_activity_cap,
            EventStream::UserActivity => self.config.user_activity_cap,
            EventStream::System => self.config.system_events_cap,
        };
        cap.max(1)
    }

    // ===== PUBLISH =====

    pub async fn publish_chat_message(&self, message: &ChatMessage) {
        self.append(&EventStream::Chat(message.session_id.clone()), message).await;
    }

    pub async fn publish_session_activity(&self, session_id: &str, user_id: &str, kind: &str) {
        let record = EventRecord::new(kind, self.clock.now())
            .session(session_id)
            .user(user_id);
        self.append(&EventStream::SessionActivity, &record).await;
    }

    pub async fn publish_user_activity(&self, user_id: &str, kind: &str, detail: Value) {
        let record = EventRecord::new(kind, self.clock.now()).user(user_id).detail(detail);
        self.append(&EventStream::UserActivity, &record).await;
    }

    pub async fn publish_system_event(&self, kind: &str, description: &str, detail: Value) {
        let record = EventRecord::new(kind, self.clock.now())
            .description(description)
            .detail(detail);
        self.append(&EventStream::System, &record).await;
    }

    async fn append<T: Serialize>(&self, stream: &EventStream, entry: &T) {
        let key = Self::key(stream);
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode entry for {}: {}", key, e);
                return;
            }
        };

        let ttl = match stream {
            EventStream::Chat(_) => self.config.chat_stream_ttl_secs,
            _ => 0,
        };
        let call = ScriptCall::new(ScriptKind::CappedAppend)
            .key(&key)
            .arg(json)
            .arg(self.cap(stream))
            .arg(ttl);
        match self.store.run_script(&call).await {
            Ok(_) => debug!("Appended entry to {}", key),
            Err(e) => warn!("Failed to append to {}: {}", key, e),
        }
    }

    // ===== READ =====

    /// Newest `count` messages of a session, oldest first
    pub async fn read_chat_messages(&self, session_id: &str, count: usize) -> Vec<ChatMessage> {
        self.read(&EventStream::Chat(session_id.to_string()), count).await
    }

    pub async fn read_session_activity(&self, count: usize) -> Vec<EventRecord> {
        self.read(&EventStream::SessionActivity, count).await
    }

    pub async fn read_user_activity(&self, count: usize) -> Vec<EventRecord> {
        self.read(&EventStream::UserActivity, count).await
    }

    pub async fn read_system_events(&self, count: usize) -> Vec<EventRecord> {
        self.read(&EventStream::System, count).await
    }

    /// Newest `count` entries, oldest first. Unreadable entries are skipped.
    async fn read<T: DeserializeOwned>(&self, stream: &EventStream, count: usize) -> Vec<T> {
        if count == 0 {
            return Vec::new();
        }
        let key = Self::key(stream);
        let start = -isize::try_from(count).unwrap_or(isize::MAX);
        let raw = match self.store.lrange(&key, start, -1).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Reading {} failed: {}", key, e);
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", key, e);
                    None
                }
            })
            .collect()
    }

    pub async fn length(&self, stream: &EventStream) -> u64 {
        let key = Self::key(stream);
        self.store.llen(&key).await.unwrap_or_else(|e| {
            warn!("Reading length of {} failed: {}", key, e);
            0
        })
    }

    /// Sessions that currently have a chat stream
    pub async fn chat_streams(&self) -> Vec<SessionId> {
        match self.store.keys(&keys::all_under(keys::CHAT_STREAM_PREFIX)).await {
            Ok(found) => found
                .into_iter()
                .filter_map(|key| key.strip_prefix(keys::CHAT_STREAM_PREFIX).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!("Listing chat streams failed: {}", e);
                Vec::new()
            }
        }
    }

    // ===== MAINTENANCE =====

    /// Trim every log to half its cap. Returns the number of logs visited.
    pub async fn compact(&self) -> usize {
        let mut streams: Vec<EventStream> = self
            .chat_streams()
            .await
            .into_iter()
            .map(EventStream::Chat)
            .collect();
        streams.extend([EventStream::SessionActivity, EventStream::UserActivity, EventStream::System]);

        let mut trimmed = 0;
        for stream in &streams {
            let keep = isize::try_from((self.cap(stream) / 2).max(1)).unwrap_or(isize::MAX);
            let key = Self::key(stream);
            match self.store.ltrim(&key, -keep, -1).await {
                Ok(()) => trimmed += 1,
                Err(e) => warn!("Compacting {} failed: {}", key, e),
            }
        }
        info!("Compacted {} event logs", trimmed);
        trimmed
    }

    /// Returns whether the stream existed
    pub async fn delete(&self, stream: &EventStream) -> bool {
        let key = Self::key(stream);
        self.store.del(&key).await.unwrap_or_else(|e| {
            warn!("Deleting {} failed: {}", key, e);
            false
        })
    }
}
