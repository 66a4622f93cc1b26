use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub type SessionId = String;
pub type MessageId = String;

pub const MAX_MESSAGE_CHARS: usize = 10_000;
pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_USER_ID_CHARS: usize = 100;
pub const MAX_SESSION_ID_CHARS: usize = 128;
pub const DEFAULT_SESSION_TITLE: &str = "New Chat Session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

// ===== MESSAGE =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Filled lazily from the token estimator
    #[serde(default)]
    pub token_count: Option<usize>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ChatMessage {
    pub fn new(session_id: impl Into<SessionId>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            token_count: None,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(SessionId::new(), MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(SessionId::new(), MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SessionId::new(), MessageRole::System, content)
    }

    /// Late metadata attachment is the only mutation after creation
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ===== SESSION =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub user_id: String,
    pub title: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub token_count: u64,
    pub settings: HashMap<String, Value>,
}

/// Hash field names shared with the Lua scripts
pub mod fields {
    pub const USER_ID: &str = "user_id";
    pub const TITLE: &str = "title";
    pub const ACTIVE: &str = "active";
    pub const CREATED_AT: &str = "created_at";
    pub const LAST_ACTIVITY: &str = "last_activity";
    pub const MESSAGE_COUNT: &str = "message_count";
    pub const TOKEN_COUNT: &str = "token_count";
    pub const SETTINGS: &str = "settings";
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_session_id(),
            user_id: user_id.into(),
            title: title.into(),
            active: true,
            created_at: now,
            last_activity: now,
            message_count: 0,
            token_count: 0,
            settings: HashMap::new(),
        }
    }

    /// Flatten into hash fields; timestamps are epoch millis
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let settings = serde_json::to_string(&self.settings).unwrap_or_else(|_| "{}".to_string());
        vec![
            (fields::USER_ID.to_string(), self.user_id.clone()),
            (fields::TITLE.to_string(), self.title.clone()),
            (fields::ACTIVE.to_string(), self.active.to_string()),
            (fields::CREATED_AT.to_string(), self.created_at.timestamp_millis().to_string()),
            (fields::LAST_ACTIVITY.to_string(), self.last_activity.timestamp_millis().to_string()),
            (fields::MESSAGE_COUNT.to_string(), self.message_count.to_string()),
            (fields::TOKEN_COUNT.to_string(), self.token_count.to_string()),
            (fields::SETTINGS.to_string(), settings),
        ]
    }

    /// Rebuild from hash fields. `None` when the hash is missing required fields.
    pub fn from_fields(id: &str, map: &HashMap<String, String>) -> Option<Self> {
        let user_id = map.get(fields::USER_ID)?.clone();
        let created_at = millis_to_datetime(map.get(fields::CREATED_AT)?.parse().ok()?)?;
        let last_activity = map
            .get(fields::LAST_ACTIVITY)
            .and_then(|v| v.parse().ok())
            .and_then(millis_to_datetime)
            .unwrap_or(created_at);
        let settings = match map.get(fields::SETTINGS) {
            Some(raw) => serde_json::from_str(raw).ok()?,
            None => HashMap::new(),
        };

        Some(Self {
            id: id.to_string(),
            user_id,
            title: map.get(fields::TITLE).cloned().unwrap_or_default(),
            active: map.get(fields::ACTIVE).map(|v| v != "false").unwrap_or(true),
            created_at,
            last_activity,
            message_count: map.get(fields::MESSAGE_COUNT).and_then(|v| v.parse().ok()).unwrap_or(0),
            token_count: map.get(fields::TOKEN_COUNT).and_then(|v| v.parse().ok()).unwrap_or(0),
            settings,
        })
    }
}

// ===== CACHE ENTRY =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hex SHA-256 of `input|model|temperature`
    pub key: String,
    pub response: String,
    pub session_id: SessionId,
    pub model: String,
    pub temperature: String,
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
}

// ===== SESSION STATS SNAPSHOT =====

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub message_count: u64,
    pub token_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub message_list_length: u64,
    /// Remaining seconds; -1 no TTL, -2 missing key
    pub session_ttl: i64,
    pub message_list_ttl: i64,
}

pub fn new_session_id() -> SessionId {
    format!("session_{}", Uuid::new_v4().simple())
}

pub fn new_message_id() -> MessageId {
    format!("msg_{}", Uuid::new_v4().simple())
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
