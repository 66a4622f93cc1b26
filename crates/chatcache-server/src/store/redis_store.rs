use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, FromRedisValue, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::scripts::{ReplyShape, ScriptCall, ScriptKind, ScriptReply};
use super::{duration_millis, score_arg, ttl_secs, KvStore};
use crate::config::StoreConfig;
use crate::utils::{StoreError, StoreResult};

/// Redis backend over a self-reconnecting multiplexed connection.
/// Every command is bounded by `op_timeout`.
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    scripts: HashMap<ScriptKind, redis::Script>,
}

impl RedisStore {
    pub async fn connect(cfg: &StoreConfig) -> StoreResult<Self> {
        let client = Client::open(cfg.url.as_str())?;

        let conn = match timeout(cfg.connect_timeout(), ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(StoreError::Unavailable(format!(
                    "no connection to {} within {}ms",
                    cfg.url, cfg.connect_timeout_ms
                )))
            }
        };

        let scripts = ScriptKind::ALL
            .iter()
            .map(|kind| (*kind, redis::Script::new(kind.lua())))
            .collect();

        let store = Self {
            conn,
            op_timeout: cfg.op_timeout(),
            scripts,
        };
        store.ping().await?;
        Ok(store)
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout { op }),
        }
    }

    async fn query<T: FromRedisValue>(&self, op: &'static str, cmd: Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        self.timed(op, async move { cmd.query_async(&mut conn).await }).await
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let pong: String = self.query("PING", redis::cmd("PING")).await?;
        debug!("redis ping: {}", pong);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query("GET", cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(duration_millis(ttl).max(1));
        }
        let _: () = self.query("SET", cmd).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.query("DEL", cmd).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        let applied: i64 = self.query("EXPIRE", cmd).await?;
        Ok(applied == 1)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self.query("EXISTS", cmd).await?;
        Ok(count > 0)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(pattern);
        let mut keys: Vec<String> = self.query("KEYS", cmd).await?;
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query("HGET", cmd).await
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: i64 = self.query("HSET", cmd).await?;
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.query("HINCRBY", cmd).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query("HGETALL", cmd).await
    }

    async fn zadd_gt(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg("GT").arg(score_arg(score)).arg(member);
        let _: i64 = self.query("ZADD", cmd).await?;
        Ok(())
    }

    async fn zrevrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(start).arg(stop).arg("WITHSCORES");
        self.query("ZREVRANGE", cmd).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        self.query("ZRANGEBYSCORE", cmd).await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut cmd = redis::cmd("ZSCORE");
        cmd.arg(key).arg(member);
        self.query("ZSCORE", cmd).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.query("ZCARD", cmd).await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut cmd = redis::cmd("ZCOUNT");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        self.query("ZCOUNT", cmd).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(member);
        let removed: i64 = self.query("ZREM", cmd).await?;
        Ok(removed > 0)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        self.query("ZREMRANGEBYSCORE", cmd).await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.query("RPUSH", cmd).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query("LRANGE", cmd).await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        let mut cmd = redis::cmd("LTRIM");
        cmd.arg(key).arg(start).arg(stop);
        let _: () = self.query("LTRIM", cmd).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.query("LLEN", cmd).await
    }

    async fn run_script(&self, call: &ScriptCall) -> StoreResult<ScriptReply> {
        let name = call.kind.name();
        let script = self.scripts.get(&call.kind).ok_or_else(|| StoreError::Script {
            script: name,
            reason: "script not registered".to_string(),
        })?;

        let mut invocation = script.prepare_invoke();
        for key in &call.keys {
            invocation.key(key);
        }
        for arg in &call.args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let reply = match call.kind.reply_shape() {
            ReplyShape::Int => self
                .timed(name, async move { invocation.invoke_async(&mut conn).await.map(ScriptReply::Int) })
                .await,
            ReplyShape::Ints => self
                .timed(name, async move { invocation.invoke_async(&mut conn).await.map(ScriptReply::Ints) })
                .await,
            ReplyShape::Strings => self
                .timed(name, async move { invocation.invoke_async(&mut conn).await.map(ScriptReply::Strings) })
                .await,
        };

        reply.map_err(|e| {
            if e.is_transient() {
                e
            } else {
                StoreError::Script {
                    script: name,
                    reason: e.to_string(),
                }
            }
        })
    }
}
