//! Store key layout shared by every service

pub const SESSION_PREFIX: &str = "session:";
pub const MESSAGES_PREFIX: &str = "messages:";
pub const MESSAGE_PREFIX: &str = "message:";
pub const MARKER_PREFIX: &str = "activity:session:";
pub const OWNER_PREFIX: &str = "activity:owner:";
pub const USER_SESSIONS_PREFIX: &str = "user:sessions:";
pub const CACHE_RESPONSE_PREFIX: &str = "cache:response:";
pub const CHAT_STREAM_PREFIX: &str = "chat:stream:";

pub const SESSION_RANKING: &str = "activity:sessions:sorted";
pub const USER_RANKING: &str = "activity:users:sorted";
pub const CACHE_STATS: &str = "cache:stats";

// Event logs. Kept outside `session:*` so session sweeps never see them.
pub const SESSION_EVENTS: &str = "events:session_activity";
pub const USER_EVENTS: &str = "events:user_activity";
pub const SYSTEM_EVENTS: &str = "events:system";

pub fn session(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

pub fn messages(session_id: &str) -> String {
    format!("{}{}", MESSAGES_PREFIX, session_id)
}

pub fn message(message_id: &str) -> String {
    format!("{}{}", MESSAGE_PREFIX, message_id)
}

pub fn activity_marker(session_id: &str) -> String {
    format!("{}{}", MARKER_PREFIX, session_id)
}

/// User that last recorded activity on a session
pub fn session_owner(session_id: &str) -> String {
    format!("{}{}", OWNER_PREFIX, session_id)
}

pub fn user_sessions(user_id: &str) -> String {
    format!("{}{}", USER_SESSIONS_PREFIX, user_id)
}

pub fn cached_response(hash: &str) -> String {
    format!("{}{}", CACHE_RESPONSE_PREFIX, hash)
}

pub fn chat_stream(session_id: &str) -> String {
    format!("{}{}", CHAT_STREAM_PREFIX, session_id)
}

pub fn user_rate_limit(user_id: &str) -> String {
    format!("rate_limit:user:{}", user_id)
}

pub fn session_rate_limit(session_id: &str) -> String {
    format!("rate_limit:session:{}", session_id)
}

/// Glob matching every key under a prefix
pub fn all_under(prefix: &str) -> String {
    format!("{}*", prefix)
}
