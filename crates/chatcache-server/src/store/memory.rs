use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::scripts::{ScriptCall, ScriptKind, ScriptReply};
use super::{duration_millis, KvStore};
use crate::models::chat::fields;
use crate::utils::{Clock, StoreError, StoreResult};

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

struct Slot {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self { value, expires_at_ms: None }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now >= at)
    }
}

/// Keyspace with redis-like typing and lazy expiry
#[derive(Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn purge_expired(&mut self, key: &str, now: i64) {
        if self.slots.get(key).is_some_and(|s| s.is_expired(now)) {
            self.slots.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: i64) -> Option<&mut Slot> {
        self.purge_expired(key, now);
        self.slots.get_mut(key)
    }

    /// Drop aggregates that became empty, as redis does
    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|s| s.value.is_empty()) {
            self.slots.remove(key);
        }
    }

    fn string(&mut self, key: &str, now: i64) -> StoreResult<Option<&String>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot { value: Value::Str(s), .. }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash(&mut self, key: &str, now: i64) -> StoreResult<Option<&mut HashMap<String, String>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot { value: Value::Hash(h), .. }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_or_create(&mut self, key: &str, now: i64) -> StoreResult<&mut HashMap<String, String>> {
        self.purge_expired(key, now);
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));
        match &mut slot.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset(&mut self, key: &str, now: i64) -> StoreResult<Option<&mut HashMap<String, f64>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot { value: Value::ZSet(z), .. }) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zset_or_create(&mut self, key: &str, now: i64) -> StoreResult<&mut HashMap<String, f64>> {
        self.purge_expired(key, now);
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::ZSet(HashMap::new())));
        match &mut slot.value {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn list(&mut self, key: &str, now: i64) -> StoreResult<Option<&mut VecDeque<String>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot { value: Value::List(l), .. }) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_or_create(&mut self, key: &str, now: i64) -> StoreResult<&mut VecDeque<String>> {
        self.purge_expired(key, now);
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::List(VecDeque::new())));
        match &mut slot.value {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_string(&mut self, key: &str, value: &str, expires_at_ms: Option<i64>) {
        self.slots.insert(
            key.to_string(),
            Slot { value: Value::Str(value.to_string()), expires_at_ms },
        );
    }

    fn expire(&mut self, key: &str, now: i64, ttl_ms: i64) -> bool {
        match self.live(key, now) {
            Some(slot) => {
                slot.expires_at_ms = Some(now.saturating_add(ttl_ms));
                true
            }
            None => false,
        }
    }

    /// Remaining TTL in seconds: -2 missing, -1 no expiry
    fn ttl_secs(&mut self, key: &str, now: i64) -> i64 {
        match self.live(key, now) {
            None => -2,
            Some(Slot { expires_at_ms: None, .. }) => -1,
            Some(Slot { expires_at_ms: Some(at), .. }) => (*at - now + 500) / 1000,
        }
    }

    fn matching_keys(&mut self, pattern: &str, now: i64) -> StoreResult<Vec<String>> {
        let matcher = glob::Pattern::new(pattern).map_err(|e| StoreError::InvalidPattern(e.to_string()))?;
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let mut keys: Vec<String> = self.slots.keys().filter(|k| matcher.matches(k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn hincr_by(&mut self, key: &str, field: &str, delta: i64, now: i64) -> StoreResult<i64> {
        let hash = self.hash_or_create(key, now)?;
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| wrong_type(key))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    /// First of `fields` holding something other than an integer
    fn non_integer_field<'f>(&mut self, key: &str, fields: &[&'f str], now: i64) -> StoreResult<Option<&'f str>> {
        Ok(self.hash(key, now)?.and_then(|hash| {
            fields
                .iter()
                .copied()
                .find(|field| hash.get(*field).is_some_and(|raw| raw.parse::<i64>().is_err()))
        }))
    }

    fn zrem_range_by_score(&mut self, key: &str, min: f64, max: f64, now: i64) -> StoreResult<u64> {
        let removed = match self.zset(key, now)? {
            Some(z) => {
                let before = z.len();
                z.retain(|_, score| *score < min || *score > max);
                (before - z.len()) as u64
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// ZREM that skips keys holding another type
    fn zrem_member(&mut self, key: &str, member: &str, now: i64) -> bool {
        let removed = match self.zset(key, now) {
            Ok(Some(z)) => z.remove(member).is_some(),
            _ => false,
        };
        self.drop_if_empty(key);
        removed
    }

    fn ltrim(&mut self, key: &str, start: isize, stop: isize, now: i64) -> StoreResult<()> {
        if let Some(list) = self.list(key, now)? {
            match rank_range(list.len(), start, stop) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
        }
        self.drop_if_empty(key);
        Ok(())
    }
}

/// In-process backend. One lock guards the whole keyspace, so every call and
/// every script runs as a single step relative to all other callers.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn run_script_locked(&self, ks: &mut Keyspace, call: &ScriptCall, now: i64) -> StoreResult<ScriptReply> {
        let script = ScriptArgs { call };
        match call.kind {
            ScriptKind::SessionCounters => {
                let session_key = script.key(0)?;
                let message_delta = script.int(0)?;
                let token_delta = script.int(1)?;
                let last_activity = script.str(2)?;
                let ttl_ms = script.int(3)?.saturating_mul(1000);

                script.check_counters(ks, session_key, now)?;

                let count = ks.hincr_by(session_key, fields::MESSAGE_COUNT, message_delta, now)?;
                ks.hincr_by(session_key, fields::TOKEN_COUNT, token_delta, now)?;
                ks.hash_or_create(session_key, now)?
                    .insert(fields::LAST_ACTIVITY.to_string(), last_activity.to_string());
                ks.expire(session_key, now, ttl_ms);
                Ok(ScriptReply::Int(count))
            }
            ScriptKind::MessageAppend => {
                let list_key = script.key(0)?;
                let session_key = script.key(1)?;
                let message_id = script.str(0)?;
                let max_messages = script.int(1)?.max(1) as isize;
                let ttl_ms = script.int(2)?.saturating_mul(1000);
                let last_activity = script.str(3)?;
                let token_delta = script.int(4)?;

                // every check runs before the first write
                ks.list(list_key, now)?;
                script.check_counters(ks, session_key, now)?;

                ks.list_or_create(list_key, now)?.push_back(message_id.to_string());
                ks.ltrim(list_key, -max_messages, -1, now)?;

                ks.hincr_by(session_key, fields::MESSAGE_COUNT, 1, now)?;
                ks.hincr_by(session_key, fields::TOKEN_COUNT, token_delta, now)?;
                ks.hash_or_create(session_key, now)?
                    .insert(fields::LAST_ACTIVITY.to_string(), last_activity.to_string());

                ks.expire(session_key, now, ttl_ms);
                ks.expire(list_key, now, ttl_ms);

                let len = ks.list(list_key, now)?.map(|l| l.len()).unwrap_or(0);
                Ok(ScriptReply::Int(len as i64))
            }
            ScriptKind::SlidingWindow => {
                let key = script.key(0)?;
                let window = script.int(0)?;
                let limit = script.int(1)?;
                let script_now = script.int(2)?;
                let member = script.str(3)?;

                ks.zrem_range_by_score(key, f64::NEG_INFINITY, (script_now - window) as f64, now)?;
                let current = ks.zset(key, now)?.map(|z| z.len() as i64).unwrap_or(0);

                if current < limit {
                    ks.zset_or_create(key, now)?.insert(member.to_string(), script_now as f64);
                    ks.expire(key, now, window);
                    return Ok(ScriptReply::Ints(vec![1, limit - current - 1, 0]));
                }

                let oldest = ks
                    .zset(key, now)?
                    .and_then(|z| z.values().copied().reduce(f64::min));
                let retry_after = match oldest {
                    Some(score) => score as i64 + window - script_now,
                    None => window,
                };
                Ok(ScriptReply::Ints(vec![0, 0, retry_after]))
            }
            ScriptKind::SetIfStale => {
                let key = script.key(0)?;
                let value = script.str(0)?;
                let ttl = script.int(1)?;

                let current_ttl = ks.ttl_secs(key, now);
                if current_ttl == -2 || (current_ttl > 0 && (current_ttl as f64) < ttl as f64 / 2.0) {
                    ks.set_string(key, value, Some(now.saturating_add(ttl.saturating_mul(1000))));
                    Ok(ScriptReply::Int(1))
                } else {
                    Ok(ScriptReply::Int(0))
                }
            }
            ScriptKind::CleanupIdle => {
                let ranking_key = script.key(0)?;
                let session_prefix = script.str(0)?;
                let max_age = script.int(1)?;
                let script_now = script.int(2)?;
                let batch_size = script.int(3).unwrap_or(100).max(0) as usize;
                let messages_prefix = script.str(4)?;
                let message_prefix = script.str(5)?;
                let marker_prefix = script.str(6)?;
                let user_sessions_prefix = script.str(7)?;
                let owner_prefix = script.str(8)?;

                let pattern = format!("{}*", glob::Pattern::escape(session_prefix));
                let cutoff = script_now.saturating_sub(max_age);
                let mut deleted = 0;
                for key in ks.matching_keys(&pattern, now)?.into_iter().take(batch_size) {
                    let (last_activity, user_id) = match ks.hash(&key, now) {
                        Ok(Some(h)) => (
                            h.get(fields::LAST_ACTIVITY).and_then(|v| v.parse::<i64>().ok()),
                            h.get(fields::USER_ID).cloned(),
                        ),
                        _ => continue,
                    };
                    if !last_activity.is_some_and(|at| at < cutoff) {
                        continue;
                    }

                    let id = &key[session_prefix.len()..];
                    let list_key = format!("{}{}", messages_prefix, id);
                    let message_ids: Vec<String> = match ks.list(&list_key, now) {
                        Ok(Some(list)) => list.iter().cloned().collect(),
                        _ => Vec::new(),
                    };
                    for message_id in message_ids {
                        ks.slots.remove(&format!("{}{}", message_prefix, message_id));
                    }
                    for doomed in [
                        key.clone(),
                        list_key,
                        format!("{}{}", marker_prefix, id),
                        format!("{}{}", owner_prefix, id),
                    ] {
                        ks.slots.remove(&doomed);
                    }

                    ks.zrem_member(ranking_key, id, now);
                    if let Some(user_id) = user_id {
                        ks.zrem_member(&format!("{}{}", user_sessions_prefix, user_id), id, now);
                    }
                    deleted += 1;
                }
                Ok(ScriptReply::Int(deleted))
            }
            ScriptKind::BulkDelete => {
                let pattern = script.str(0)?;
                let batch_size = script.int(1).unwrap_or(100).max(0) as usize;

                let mut deleted = 0;
                for key in ks.matching_keys(pattern, now)?.into_iter().take(batch_size) {
                    if ks.slots.remove(&key).is_some() {
                        deleted += 1;
                    }
                }
                Ok(ScriptReply::Int(deleted))
            }
            ScriptKind::SessionSnapshot => {
                let session_key = script.key(0)?;
                let list_key = script.key(1)?;

                let hash = ks.hash(session_key, now)?.cloned().unwrap_or_default();
                let field = |name: &str, default: &str| hash.get(name).cloned().unwrap_or_else(|| default.to_string());
                let list_len = ks.list(list_key, now)?.map(|l| l.len()).unwrap_or(0);

                Ok(ScriptReply::Strings(vec![
                    "message_count".into(),
                    field(fields::MESSAGE_COUNT, "0"),
                    "token_count".into(),
                    field(fields::TOKEN_COUNT, "0"),
                    "last_activity".into(),
                    field(fields::LAST_ACTIVITY, ""),
                    "created_at".into(),
                    field(fields::CREATED_AT, ""),
                    "active".into(),
                    field(fields::ACTIVE, "true"),
                    "message_list_length".into(),
                    list_len.to_string(),
                    "session_ttl".into(),
                    ks.ttl_secs(session_key, now).to_string(),
                    "message_list_ttl".into(),
                    ks.ttl_secs(list_key, now).to_string(),
                ]))
            }
            ScriptKind::CappedAppend => {
                let key = script.key(0)?;
                let value = script.str(0)?;
                let cap = script.int(1)?.max(1);
                let ttl = script.int(2)?;

                ks.list_or_create(key, now)?.push_back(value.to_string());
                ks.ltrim(key, -(cap as isize), -1, now)?;
                if ttl > 0 {
                    ks.expire(key, now, ttl.saturating_mul(1000));
                }
                let len = ks.list(key, now)?.map(|l| l.len()).unwrap_or(0);
                Ok(ScriptReply::Int(len as i64))
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.now();
        Ok(self.keyspace.lock().string(key, now)?.cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.now();
        let expires_at_ms = ttl.map(|t| now.saturating_add(duration_millis(t)));
        self.keyspace.lock().set_string(key, value, expires_at_ms);
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        ks.purge_expired(key, now);
        Ok(ks.slots.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.now();
        Ok(self.keyspace.lock().expire(key, now, duration_millis(ttl)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = self.now();
        Ok(self.keyspace.lock().live(key, now).is_some())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = self.now();
        self.keyspace.lock().matching_keys(pattern, now)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let now = self.now();
        Ok(self.keyspace.lock().hash(key, now)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let now = self.now();
        let mut ks = self.keyspace.lock();
        let hash = ks.hash_or_create(key, now)?;
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let now = self.now();
        self.keyspace.lock().hincr_by(key, field, delta, now)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.now();
        Ok(self.keyspace.lock().hash(key, now)?.cloned().unwrap_or_default())
    }

    async fn zadd_gt(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        let zset = ks.zset_or_create(key, now)?;
        let entry = zset.entry(member.to_string()).or_insert(score);
        if score > *entry {
            *entry = score;
        }
        Ok(())
    }

    async fn zrevrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        let mut entries: Vec<(String, f64)> = match ks.zset(key, now)? {
            Some(z) => z.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            None => return Ok(Vec::new()),
        };
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(match rank_range(entries.len(), start, stop) {
            Some((from, to)) => entries[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        let mut entries: Vec<(String, f64)> = match ks.zset(key, now)? {
            Some(z) => z
                .iter()
                .filter(|(_, s)| **s >= min && **s <= max)
                .map(|(m, s)| (m.clone(), *s))
                .collect(),
            None => return Ok(Vec::new()),
        };
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries.into_iter().map(|(m, _)| m).collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let now = self.now();
        Ok(self.keyspace.lock().zset(key, now)?.and_then(|z| z.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let now = self.now();
        Ok(self.keyspace.lock().zset(key, now)?.map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let now = self.now();
        Ok(self
            .keyspace
            .lock()
            .zset(key, now)?
            .map(|z| z.values().filter(|s| **s >= min && **s <= max).count() as u64)
            .unwrap_or(0))
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        ks.zset(key, now)?;
        Ok(ks.zrem_member(key, member, now))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let now = self.now();
        self.keyspace.lock().zrem_range_by_score(key, min, max, now)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        let list = ks.list_or_create(key, now)?;
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        Ok(match ks.list(key, now)? {
            Some(list) => match rank_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            },
            None => Vec::new(),
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        let now = self.now();
        self.keyspace.lock().ltrim(key, start, stop, now)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let now = self.now();
        Ok(self.keyspace.lock().list(key, now)?.map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn run_script(&self, call: &ScriptCall) -> StoreResult<ScriptReply> {
        let now = self.now();
        let mut ks = self.keyspace.lock();
        self.run_script_locked(&mut ks, call, now)
    }
}

/// Typed access to script KEYS/ARGV
struct ScriptArgs<'a> {
    call: &'a ScriptCall,
}

impl<'a> ScriptArgs<'a> {
    fn key(&self, idx: usize) -> StoreResult<&'a str> {
        self.call
            .keys
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| self.error(format!("missing KEYS[{}]", idx + 1)))
    }

    fn str(&self, idx: usize) -> StoreResult<&'a str> {
        self.call
            .args
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| self.error(format!("missing ARGV[{}]", idx + 1)))
    }

    fn int(&self, idx: usize) -> StoreResult<i64> {
        let raw = self.str(idx)?;
        raw.parse::<i64>()
            .or_else(|_| raw.parse::<f64>().map(|f| f as i64))
            .map_err(|_| self.error(format!("ARGV[{}] is not a number: {}", idx + 1, raw)))
    }

    /// Session counters must be integers before any HINCRBY runs
    fn check_counters(&self, ks: &mut Keyspace, session_key: &str, now: i64) -> StoreResult<()> {
        match ks.non_integer_field(session_key, &[fields::MESSAGE_COUNT, fields::TOKEN_COUNT], now)? {
            Some(field) => Err(self.error(format!("{} is not an integer", field))),
            None => Ok(()),
        }
    }

    fn error(&self, reason: String) -> StoreError {
        StoreError::Script { script: self.call.kind.name(), reason }
    }
}

/// Resolve a redis-style inclusive rank range to concrete indices
fn rank_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at_epoch_2026());
        (MemoryStore::new(clock.clone()), clock)
    }

    #[test]
    fn test_rank_range() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, -2, -1), Some((3, 4)));
        assert_eq!(rank_range(5, -50, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 3, 100), Some((3, 4)));
        assert_eq!(rank_range(5, 4, 2), None);
        assert_eq!(rank_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_ttl_expires_lazily() {
        let (store, clock) = store();
        store.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let (store, _) = store();
        store.set("k", "v", None).await.unwrap();
        assert!(matches!(
            store.hget("k", "f").await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_zadd_gt_never_lowers_score() {
        let (store, _) = store();
        store.zadd_gt("z", "a", 10.0).await.unwrap();
        store.zadd_gt("z", "a", 5.0).await.unwrap();
        assert_eq!(store.zscore("z", "a").await.unwrap(), Some(10.0));
        store.zadd_gt("z", "a", 20.0).await.unwrap();
        assert_eq!(store.zscore("z", "a").await.unwrap(), Some(20.0));
    }

    #[tokio::test]
    async fn test_zrevrange_orders_by_score_desc() {
        let (store, _) = store();
        store.zadd_gt("z", "a", 1.0).await.unwrap();
        store.zadd_gt("z", "b", 3.0).await.unwrap();
        store.zadd_gt("z", "c", 2.0).await.unwrap();

        let top = store.zrevrange_with_scores("z", 0, 1).await.unwrap();
        assert_eq!(top, vec![("b".to_string(), 3.0), ("c".to_string(), 2.0)]);
        assert_eq!(store.zcount("z", 2.0, f64::INFINITY).await.unwrap(), 2);
        assert_eq!(store.zrem_range_by_score("z", f64::NEG_INFINITY, 2.0).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_trim_keeps_tail() {
        let (store, _) = store();
        for i in 0..5 {
            store.rpush("l", &i.to_string()).await.unwrap();
        }
        store.ltrim("l", -3, -1).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["2", "3", "4"]);
        assert_eq!(store.llen("l").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let (store, _) = store();
        store.set("cache:response:1", "x", None).await.unwrap();
        store.set("cache:response:2", "x", None).await.unwrap();
        store.set("cache:stats", "x", None).await.unwrap();
        let keys = store.keys("cache:response:*").await.unwrap();
        assert_eq!(keys, vec!["cache:response:1", "cache:response:2"]);
    }

    #[tokio::test]
    async fn test_message_append_script_trims_and_counts() {
        let (store, _) = store();
        for i in 0..4 {
            let call = ScriptCall::new(ScriptKind::MessageAppend)
                .key("messages:s1")
                .key("session:s1")
                .arg(format!("m{}", i))
                .arg(3)
                .arg(60)
                .arg(1000 + i)
                .arg(7);
            store.run_script(&call).await.unwrap();
        }

        assert_eq!(store.lrange("messages:s1", 0, -1).await.unwrap(), vec!["m1", "m2", "m3"]);
        let session = store.hgetall("session:s1").await.unwrap();
        assert_eq!(session.get(fields::MESSAGE_COUNT).map(String::as_str), Some("4"));
        assert_eq!(session.get(fields::TOKEN_COUNT).map(String::as_str), Some("28"));
        assert_eq!(session.get(fields::LAST_ACTIVITY).map(String::as_str), Some("1003"));
    }

    #[tokio::test]
    async fn test_failed_script_leaves_keyspace_untouched() {
        let (store, _) = store();
        store.set("messages:s1", "not a list", None).await.unwrap();
        let call = ScriptCall::new(ScriptKind::MessageAppend)
            .key("messages:s1")
            .key("session:s1")
            .arg("m1")
            .arg(50)
            .arg(60)
            .arg(1)
            .arg(1);
        assert!(store.run_script(&call).await.is_err());
        assert!(!store.exists("session:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_integer_counter_leaves_keyspace_untouched() {
        let (store, _) = store();
        store
            .hset_multiple("session:s1", &[(fields::MESSAGE_COUNT.to_string(), "abc".to_string())])
            .await
            .unwrap();

        let append = ScriptCall::new(ScriptKind::MessageAppend)
            .key("messages:s1")
            .key("session:s1")
            .arg("m1")
            .arg(50)
            .arg(60)
            .arg(1)
            .arg(1);
        assert!(matches!(
            store.run_script(&append).await,
            Err(StoreError::Script { script: "message_append", .. })
        ));
        assert!(!store.exists("messages:s1").await.unwrap());

        let counters = ScriptCall::new(ScriptKind::SessionCounters)
            .key("session:s1")
            .arg(1)
            .arg(1)
            .arg(99)
            .arg(60);
        assert!(store.run_script(&counters).await.is_err());

        let session = store.hgetall("session:s1").await.unwrap();
        assert_eq!(session.len(), 1);
        assert_eq!(session.get(fields::MESSAGE_COUNT).map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_wrap() {
        let (store, clock) = store();
        store.set("k", "v", Some(Duration::MAX)).await.unwrap();
        store.set("e", "v", None).await.unwrap();
        assert!(store.expire("e", Duration::MAX).await.unwrap());

        clock.advance(chrono::Duration::days(365));
        assert!(store.exists("k").await.unwrap());
        assert!(store.exists("e").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_stale_respects_half_ttl() {
        let (store, clock) = store();
        let call = ScriptCall::new(ScriptKind::SetIfStale).key("k").arg("v1").arg(100);
        assert_eq!(store.run_script(&call).await.unwrap(), ScriptReply::Int(1));

        let call = ScriptCall::new(ScriptKind::SetIfStale).key("k").arg("v2").arg(100);
        assert_eq!(store.run_script(&call).await.unwrap(), ScriptReply::Int(0));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(store.run_script(&call).await.unwrap(), ScriptReply::Int(1));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_bulk_delete_is_bounded() {
        let (store, _) = store();
        for i in 0..5 {
            store.set(&format!("session:{}", i), "x", None).await.unwrap();
        }
        let call = ScriptCall::new(ScriptKind::BulkDelete).arg("session:*").arg(3);
        assert_eq!(store.run_script(&call).await.unwrap(), ScriptReply::Int(3));
        assert_eq!(store.keys("session:*").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_capped_append_keeps_newest() {
        let (store, _) = store();
        for i in 0..5 {
            let call = ScriptCall::new(ScriptKind::CappedAppend).key("log").arg(i).arg(3).arg(0);
            store.run_script(&call).await.unwrap();
        }
        assert_eq!(store.lrange("log", 0, -1).await.unwrap(), vec!["2", "3", "4"]);

        store.set("text", "x", None).await.unwrap();
        let call = ScriptCall::new(ScriptKind::CappedAppend).key("text").arg("v").arg(3).arg(0);
        assert!(store.run_script(&call).await.is_err());
        assert_eq!(store.get("text").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_bad_script_argument_is_script_error() {
        let (store, _) = store();
        let call = ScriptCall::new(ScriptKind::SlidingWindow).key("k").arg("abc");
        assert!(matches!(
            store.run_script(&call).await,
            Err(StoreError::Script { script: "sliding_window", .. })
        ));
    }
}
