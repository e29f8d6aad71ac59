use super::{namespaced, KeyOp, KeyspaceError, KeyspaceStore, Result, Slot, WindowDecision};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const MOVE_MEMBER: &str = r#"
local removed
if ARGV[1] == 'z' then
    removed = redis.call('ZREM', KEYS[1], ARGV[3])
else
    removed = redis.call('SREM', KEYS[1], ARGV[3])
end
if removed == 0 then
    return 0
end
if ARGV[2] == 'z' then
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[3])
else
    redis.call('SADD', KEYS[2], ARGV[3])
end
return 1
"#;

const WINDOW_ACQUIRE: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
    return {0, count}
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[5])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return {1, count + 1}
"#;

fn command_error(op: &str, e: redis::RedisError) -> KeyspaceError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() || e.is_io_error()
    {
        KeyspaceError::Connection(format!("Redis {} failed: {}", op, e))
    } else {
        KeyspaceError::Command(format!("Redis {} failed: {}", op, e))
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis-backed keyspace (for production)
///
/// A single multiplexed connection is opened lazily and shared by all
/// callers. Pub/sub uses a dedicated connection per subscription.
pub struct RedisKeyspace {
    client: redis::Client,
    connection: OnceCell<redis::aio::MultiplexedConnection>,
    namespace: Option<String>,
}

impl RedisKeyspace {
    /// Create a new Redis keyspace
    ///
    /// # Errors
    ///
    /// Returns error if Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| KeyspaceError::Connection(format!("invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            namespace: None,
        })
    }

    /// Prefix every key and channel with `namespace`
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Check connectivity
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| command_error("PING", e))
    }

    fn key(&self, key: &str) -> String {
        namespaced(self.namespace.as_deref(), key)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| {
                        KeyspaceError::Connection(format!("Redis connection failed: {}", e))
                    })
            })
            .await?;
        Ok(conn.clone())
    }

    fn push_op(&self, pipe: &mut redis::Pipeline, op: KeyOp) {
        match op {
            KeyOp::Set { key, value, ttl } => {
                let cmd = pipe.cmd("SET").arg(self.key(&key)).arg(value);
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(millis(ttl));
                }
                cmd.ignore();
            }
            KeyOp::Del { key } => {
                pipe.cmd("DEL").arg(self.key(&key)).ignore();
            }
            KeyOp::ZAdd { key, member, score } => {
                pipe.cmd("ZADD").arg(self.key(&key)).arg(score).arg(member).ignore();
            }
            KeyOp::ZRem { key, member } => {
                pipe.cmd("ZREM").arg(self.key(&key)).arg(member).ignore();
            }
            KeyOp::SAdd { key, member } => {
                pipe.cmd("SADD").arg(self.key(&key)).arg(member).ignore();
            }
            KeyOp::SRem { key, member } => {
                pipe.cmd("SREM").arg(self.key(&key)).arg(member).ignore();
            }
            KeyOp::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE").arg(self.key(&key)).arg(millis(ttl)).ignore();
            }
        }
    }
}

#[async_trait]
impl KeyspaceStore for RedisKeyspace {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("GET", e))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| command_error("SET", e))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("DEL", e))?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("EXISTS", e))?;
        Ok(exists > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.get_connection().await?;
        let ms: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PTTL", e))?;
        // -2 missing, -1 persistent
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(self.key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("compare-and-delete", e))?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let updated: i64 = redis::Script::new(COMPARE_AND_EXPIRE)
            .key(self.key(key))
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("compare-and-expire", e))?;
        Ok(updated == 1)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("ZADD")
            .arg(self.key(key))
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| command_error("ZADD", e))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZREM", e))?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.get_connection().await?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZSCORE", e))?;
        Ok(score)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.get_connection().await?;
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(self.key(key))
            .arg(min)
            .arg(max)
            .arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let items: Vec<(String, f64)> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;
        Ok(items)
    }

    async fn ztop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let items: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.key(key))
            .arg(0)
            .arg(0)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZREVRANGE", e))?;
        Ok(items.into_iter().next())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZCARD", e))?;
        Ok(count)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.key(key))
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZREMRANGEBYSCORE", e))?;
        Ok(removed)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let added: i64 = redis::cmd("SADD")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SADD", e))?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = redis::cmd("SREM")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SREM", e))?;
        Ok(removed > 0)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let count: u64 = redis::cmd("SCARD")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SCARD", e))?;
        Ok(count)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SMEMBERS", e))?;
        members.sort();
        Ok(members)
    }

    async fn move_member(
        &self,
        from: Slot<'_>,
        to: Slot<'_>,
        member: &str,
        score: f64,
    ) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let moved: i64 = redis::Script::new(MOVE_MEMBER)
            .key(self.key(from.key()))
            .key(self.key(to.key()))
            .arg(from.tag())
            .arg(to.tag())
            .arg(member)
            .arg(score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("move-member", e))?;
        Ok(moved == 1)
    }

    async fn window_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> Result<WindowDecision> {
        let mut conn = self.get_connection().await?;
        let window_start = now_ms - window.as_millis() as i64;
        let (allowed, count): (i64, u64) = redis::Script::new(WINDOW_ACQUIRE)
            .key(self.key(key))
            .arg(window_start)
            .arg(now_ms)
            .arg(limit)
            .arg(millis(window))
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("window-acquire", e))?;
        Ok(WindowDecision {
            allowed: allowed == 1,
            count,
        })
    }

    async fn transaction(&self, ops: Vec<KeyOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let count = ops.len();
        for op in ops {
            self.push_op(&mut pipe, op);
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| command_error("MULTI/EXEC", e))?;
        debug!(ops = count, "Keyspace transaction applied");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.key(channel))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PUBLISH", e))?;
        debug!(channel = %channel, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| KeyspaceError::Connection(format!("Redis pubsub failed: {}", e)))?;
        pubsub
            .subscribe(self.key(channel))
            .await
            .map_err(|e| command_error("SUBSCRIBE", e))?;

        let channel = channel.to_string();
        let messages = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping undecodable pubsub message");
                        None
                    }
                }
            }
        });
        Ok(messages.boxed())
    }
}
