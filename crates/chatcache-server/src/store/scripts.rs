//! Server-side atomic scripts.
//!
//! Each script takes string KEYS and ARGV and returns one typed reply. The
//! redis backend ships the Lua source; the in-memory backend runs an
//! equivalent routine under its keyspace lock. Both must agree on argument
//! order and reply shape.

/// Shape of the value a script returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    Int,
    Ints,
    Strings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// KEYS: session. ARGV: message_delta, token_delta, last_activity_ms, ttl_secs.
    /// Returns the new message count.
    SessionCounters,
    /// KEYS: message list, session. ARGV: message_id, max_messages, ttl_secs,
    /// last_activity_ms, token_delta. Returns the list length.
    MessageAppend,
    /// KEYS: window. ARGV: window_ms, limit, now_ms, member.
    /// Returns {admitted, remaining, retry_after_ms}.
    SlidingWindow,
    /// KEYS: target. ARGV: value, ttl_secs. Returns 1 when written.
    SetIfStale,
    /// KEYS: session ranking. ARGV: session_prefix, max_age_ms, now_ms,
    /// batch_size, messages_prefix, message_prefix, marker_prefix,
    /// user_sessions_prefix, owner_prefix. Deletes each idle session hash
    /// with its messages and tracking entries. Returns deleted count.
    CleanupIdle,
    /// ARGV: pattern, batch_size. Returns deleted count.
    BulkDelete,
    /// KEYS: session, message list. Returns flat field/value pairs.
    SessionSnapshot,
    /// KEYS: list. ARGV: value, cap, ttl_secs (0 keeps the current expiry).
    /// Returns the list length after trimming.
    CappedAppend,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 8] = [
        ScriptKind::SessionCounters,
        ScriptKind::MessageAppend,
        ScriptKind::SlidingWindow,
        ScriptKind::SetIfStale,
        ScriptKind::CleanupIdle,
        ScriptKind::BulkDelete,
        ScriptKind::SessionSnapshot,
        ScriptKind::CappedAppend,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScriptKind::SessionCounters => "session_counters",
            ScriptKind::MessageAppend => "message_append",
            ScriptKind::SlidingWindow => "sliding_window",
            ScriptKind::SetIfStale => "set_if_stale",
            ScriptKind::CleanupIdle => "cleanup_idle",
            ScriptKind::BulkDelete => "bulk_delete",
            ScriptKind::SessionSnapshot => "session_snapshot",
            ScriptKind::CappedAppend => "capped_append",
        }
    }

    pub fn reply_shape(&self) -> ReplyShape {
        match self {
            ScriptKind::SlidingWindow => ReplyShape::Ints,
            ScriptKind::SessionSnapshot => ReplyShape::Strings,
            _ => ReplyShape::Int,
        }
    }

    pub fn lua(&self) -> &'static str {
        match self {
            ScriptKind::SessionCounters => SESSION_COUNTERS_LUA,
            ScriptKind::MessageAppend => MESSAGE_APPEND_LUA,
            ScriptKind::SlidingWindow => SLIDING_WINDOW_LUA,
            ScriptKind::SetIfStale => SET_IF_STALE_LUA,
            ScriptKind::CleanupIdle => CLEANUP_IDLE_LUA,
            ScriptKind::BulkDelete => BULK_DELETE_LUA,
            ScriptKind::SessionSnapshot => SESSION_SNAPSHOT_LUA,
            ScriptKind::CappedAppend => CAPPED_APPEND_LUA,
        }
    }
}

/// One script invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub kind: ScriptKind,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

impl ScriptCall {
    pub fn new(kind: ScriptKind) -> Self {
        Self { kind, keys: Vec::new(), args: Vec::new() }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReply {
    Int(i64),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl ScriptReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptReply::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            ScriptReply::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            ScriptReply::Strings(v) => Some(v),
            _ => None,
        }
    }
}

const SESSION_COUNTERS_LUA: &str = r#"
local session_key = KEYS[1]
local message_delta = tonumber(ARGV[1])
local token_delta = tonumber(ARGV[2])
local last_activity = ARGV[3]
local ttl = tonumber(ARGV[4])

for _, field in ipairs({'message_count', 'token_count'}) do
    local current = redis.call('HGET', session_key, field)
    if current and not tonumber(current) then
        return redis.error_reply(field .. ' is not an integer')
    end
end

redis.call('HINCRBY', session_key, 'message_count', message_delta)
redis.call('HINCRBY', session_key, 'token_count', token_delta)
redis.call('HSET', session_key, 'last_activity', last_activity)
redis.call('EXPIRE', session_key, ttl)

return tonumber(redis.call('HGET', session_key, 'message_count'))
"#;

const MESSAGE_APPEND_LUA: &str = r#"
local list_key = KEYS[1]
local session_key = KEYS[2]
local message_id = ARGV[1]
local max_messages = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local last_activity = ARGV[4]
local token_delta = tonumber(ARGV[5])

local list_type = redis.call('TYPE', list_key).ok
if list_type ~= 'none' and list_type ~= 'list' then
    return redis.error_reply('WRONGTYPE ' .. list_key)
end
for _, field in ipairs({'message_count', 'token_count'}) do
    local current = redis.call('HGET', session_key, field)
    if current and not tonumber(current) then
        return redis.error_reply(field .. ' is not an integer')
    end
end

redis.call('RPUSH', list_key, message_id)
redis.call('LTRIM', list_key, -max_messages, -1)

redis.call('HINCRBY', session_key, 'message_count', 1)
redis.call('HINCRBY', session_key, 'token_count', token_delta)
redis.call('HSET', session_key, 'last_activity', last_activity)

redis.call('EXPIRE', session_key, ttl)
redis.call('EXPIRE', list_key, ttl)

return redis.call('LLEN', list_key)
"#;

const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local current = redis.call('ZCARD', key)
if current < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    return {1, limit - current - 1, 0}
end

local retry_after = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    retry_after = tonumber(oldest[2]) + window - now
end
return {0, 0, retry_after}
"#;

const SET_IF_STALE_LUA: &str = r#"
local key = KEYS[1]
local value = ARGV[1]
local ttl = tonumber(ARGV[2])
local current_ttl = redis.call('TTL', key)

if current_ttl == -2 or (current_ttl > 0 and current_ttl < ttl / 2) then
    redis.call('SET', key, value, 'EX', ttl)
    return 1
end
return 0
"#;

const CLEANUP_IDLE_LUA: &str = r#"
local ranking = KEYS[1]
local session_prefix = ARGV[1]
local max_age = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local batch_size = tonumber(ARGV[4] or 100)
local messages_prefix = ARGV[5]
local message_prefix = ARGV[6]
local marker_prefix = ARGV[7]
local user_sessions_prefix = ARGV[8]
local owner_prefix = ARGV[9]

local keys = redis.call('KEYS', session_prefix .. '*')
table.sort(keys)
local deleted = 0
local processed = 0

for i = 1, #keys do
    if processed >= batch_size then
        break
    end

    local key = keys[i]
    if redis.call('TYPE', key).ok == 'hash' then
        local last_activity = tonumber(redis.call('HGET', key, 'last_activity'))
        if last_activity and last_activity < (now - max_age) then
            local id = string.sub(key, #session_prefix + 1)
            local user_id = redis.call('HGET', key, 'user_id')
            local list_key = messages_prefix .. id

            if redis.call('TYPE', list_key).ok == 'list' then
                local message_ids = redis.call('LRANGE', list_key, 0, -1)
                for j = 1, #message_ids do
                    redis.call('DEL', message_prefix .. message_ids[j])
                end
            end
            redis.call('DEL', key, list_key, marker_prefix .. id, owner_prefix .. id)

            if redis.call('TYPE', ranking).ok == 'zset' then
                redis.call('ZREM', ranking, id)
            end
            if user_id then
                local user_key = user_sessions_prefix .. user_id
                if redis.call('TYPE', user_key).ok == 'zset' then
                    redis.call('ZREM', user_key, id)
                end
            end
            deleted = deleted + 1
        end
    end

    processed = processed + 1
end

return deleted
"#;

const BULK_DELETE_LUA: &str = r#"
local pattern = ARGV[1]
local batch_size = tonumber(ARGV[2] or 100)

local keys = redis.call('KEYS', pattern)
local deleted = 0

for i = 1, math.min(#keys, batch_size) do
    deleted = deleted + redis.call('DEL', keys[i])
end

return deleted
"#;

const SESSION_SNAPSHOT_LUA: &str = r#"
local session_key = KEYS[1]
local list_key = KEYS[2]

return {
    'message_count', redis.call('HGET', session_key, 'message_count') or '0',
    'token_count', redis.call('HGET', session_key, 'token_count') or '0',
    'last_activity', redis.call('HGET', session_key, 'last_activity') or '',
    'created_at', redis.call('HGET', session_key, 'created_at') or '',
    'active', redis.call('HGET', session_key, 'active') or 'true',
    'message_list_length', tostring(redis.call('LLEN', list_key)),
    'session_ttl', tostring(redis.call('TTL', session_key)),
    'message_list_ttl', tostring(redis.call('TTL', list_key))
}
"#;

const CAPPED_APPEND_LUA: &str = r#"
local key = KEYS[1]
local value = ARGV[1]
local cap = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local len = redis.call('RPUSH', key, value)
if len > cap then
    redis.call('LTRIM', key, -cap, -1)
    len = cap
end
if ttl > 0 then
    redis.call('EXPIRE', key, ttl)
end

return len
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_script_has_source_and_unique_name() {
        let mut names: Vec<&str> = ScriptKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ScriptKind::ALL.len());
        assert!(ScriptKind::ALL.iter().all(|k| k.lua().contains("redis.call")));
    }

    #[test]
    fn test_call_builder_keeps_order() {
        let call = ScriptCall::new(ScriptKind::SlidingWindow)
            .key("rate_limit:user:u1")
            .arg(60_000)
            .arg(5)
            .arg(1_000)
            .arg("m");
        assert_eq!(call.keys, vec!["rate_limit:user:u1"]);
        assert_eq!(call.args, vec!["60000", "5", "1000", "m"]);
    }
}
