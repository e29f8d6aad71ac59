//! In-process keyspace backend

use super::{namespaced, KeyOp, KeyspaceError, KeyspaceStore, Result, Slot, WindowDecision};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Data {
    entries: HashMap<String, Entry>,
}

impl Data {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str) -> Result<Option<&String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(KeyspaceError::WrongType(key.to_string())),
        }
    }

    fn zset(&mut self, key: &str) -> Result<Option<&mut HashMap<String, f64>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(KeyspaceError::WrongType(key.to_string())),
        }
    }

    fn zset_or_default(&mut self, key: &str) -> Result<&mut HashMap<String, f64>> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new()), None));
        }
        self.zset(key)?
            .ok_or_else(|| KeyspaceError::WrongType(key.to_string()))
    }

    fn set(&mut self, key: &str) -> Result<Option<&mut HashSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(KeyspaceError::WrongType(key.to_string())),
        }
    }

    fn set_or_default(&mut self, key: &str) -> Result<&mut HashSet<String>> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Set(HashSet::new()), None));
        }
        self.set(key)?
            .ok_or_else(|| KeyspaceError::WrongType(key.to_string()))
    }

    /// Drop empty collections, as Redis does
    fn prune(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::ZSet(z)) => z.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn zrem(&mut self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.zset(key)? {
            Some(z) => z.remove(member).is_some(),
            None => false,
        };
        self.prune(key);
        Ok(removed)
    }

    fn srem(&mut self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.set(key)? {
            Some(s) => s.remove(member),
            None => false,
        };
        self.prune(key);
        Ok(removed)
    }

    fn zrem_range(&mut self, key: &str, min: f64, max: f64) -> Result<u64> {
        let removed = match self.zset(key)? {
            Some(z) => {
                let before = z.len();
                z.retain(|_, score| *score < min || *score > max);
                (before - z.len()) as u64
            }
            None => 0,
        };
        self.prune(key);
        Ok(removed)
    }

    fn apply(&mut self, op: KeyOp) -> Result<()> {
        match op {
            KeyOp::Set { key, value, ttl } => {
                self.entries.insert(key, Entry::new(Value::Str(value), ttl));
            }
            KeyOp::Del { key } => {
                self.entries.remove(&key);
            }
            KeyOp::ZAdd { key, member, score } => {
                self.zset_or_default(&key)?.insert(member, score);
            }
            KeyOp::ZRem { key, member } => {
                self.zrem(&key, &member)?;
            }
            KeyOp::SAdd { key, member } => {
                self.set_or_default(&key)?.insert(member);
            }
            KeyOp::SRem { key, member } => {
                self.srem(&key, &member)?;
            }
            KeyOp::Expire { key, ttl } => {
                if let Some(entry) = self.live(&key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
        }
        Ok(())
    }

    /// Type-check a single write against the current state
    fn check(&mut self, op: &KeyOp) -> Result<()> {
        let (key, ok) = match op {
            KeyOp::ZAdd { key, .. } | KeyOp::ZRem { key, .. } => {
                (key, self.zset(key).is_ok())
            }
            KeyOp::SAdd { key, .. } | KeyOp::SRem { key, .. } => (key, self.set(key).is_ok()),
            _ => return Ok(()),
        };
        if ok {
            Ok(())
        } else {
            Err(KeyspaceError::WrongType(key.clone()))
        }
    }

    /// Apply `ops` to a copy of the keys they touch
    ///
    /// Each op sees the writes before it, so a batch that changes a key's
    /// type part way through is checked against the changed type.
    fn stage(&mut self, ops: &[KeyOp]) -> Result<HashMap<String, Option<Entry>>> {
        let mut scratch = Data::default();
        for op in ops {
            let key = op.key();
            if let Some(entry) = self.live(key) {
                let entry = entry.clone();
                scratch.entries.insert(key.to_string(), entry);
            }
        }
        for op in ops {
            scratch.apply(op.clone())?;
        }
        Ok(ops
            .iter()
            .map(|op| (op.key().to_string(), scratch.entries.get(op.key()).cloned()))
            .collect())
    }

    fn commit(&mut self, staged: HashMap<String, Option<Entry>>) {
        for (key, entry) in staged {
            match entry {
                Some(entry) => {
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

/// Sort ascending by score, ties by member
fn sorted(z: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut items: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
    items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    items
}

/// In-memory keyspace
///
/// Every operation runs under one mutex, which makes each call (including
/// `transaction`) atomic with respect to every other call.
pub struct MemoryKeyspace {
    data: Mutex<Data>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    namespace: Option<String>,
}

impl MemoryKeyspace {
    /// Create an empty keyspace
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Data::default()),
            channels: Mutex::new(HashMap::new()),
            namespace: None,
        }
    }

    /// Create an empty keyspace with a key namespace
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::new()
        }
    }

    fn key(&self, key: &str) -> String {
        namespaced(self.namespace.as_deref(), key)
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(self.key(channel))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryKeyspace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyspaceStore for MemoryKeyspace {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock().await;
        Ok(data.string(&self.key(key))?.cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut data = self.data.lock().await;
        data.apply(KeyOp::set(self.key(key), value, ttl))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(key);
        let mut data = self.data.lock().await;
        if data.live(&key).is_some() {
            return Ok(false);
        }
        data.apply(KeyOp::set(key, value, Some(ttl)))?;
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let key = self.key(key);
        let mut data = self.data.lock().await;
        let existed = data.live(&key).is_some();
        data.entries.remove(&key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        Ok(data.live(&self.key(key)).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut data = self.data.lock().await;
        let now = Instant::now();
        Ok(data
            .live(&self.key(key))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let key = self.key(key);
        let mut data = self.data.lock().await;
        if data.string(&key)?.is_some_and(|v| v == token) {
            data.entries.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(key);
        let mut data = self.data.lock().await;
        if data.string(&key)?.is_some_and(|v| v == token) {
            data.apply(KeyOp::expire(key, ttl))?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.apply(KeyOp::zadd(self.key(key), member, score))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        data.zrem(&self.key(key), member)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut data = self.data.lock().await;
        Ok(data
            .zset(&self.key(key))?
            .and_then(|z| z.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let mut data = self.data.lock().await;
        let Some(z) = data.zset(&self.key(key))? else {
            return Ok(Vec::new());
        };
        let items = sorted(z)
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(items)
    }

    async fn ztop(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock().await;
        Ok(data
            .zset(&self.key(key))?
            .and_then(|z| sorted(z).pop())
            .map(|(member, _)| member))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut data = self.data.lock().await;
        Ok(data.zset(&self.key(key))?.map_or(0, |z| z.len() as u64))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut data = self.data.lock().await;
        data.zrem_range(&self.key(key), min, max)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        Ok(data.set_or_default(&self.key(key))?.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        data.srem(&self.key(key), member)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut data = self.data.lock().await;
        Ok(data.set(&self.key(key))?.map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock().await;
        let mut members: Vec<String> = data
            .set(&self.key(key))?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
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
        let (from_key, to_key) = (self.key(from.key()), self.key(to.key()));
        let insert = match to {
            Slot::Sorted(_) => KeyOp::zadd(to_key, member, score),
            Slot::Unsorted(_) => KeyOp::sadd(to_key, member),
        };

        let mut data = self.data.lock().await;
        data.check(&insert)?;
        let removed = match from {
            Slot::Sorted(_) => data.zrem(&from_key, member)?,
            Slot::Unsorted(_) => data.srem(&from_key, member)?,
        };
        if !removed {
            return Ok(false);
        }
        data.apply(insert)?;
        Ok(true)
    }

    async fn window_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> Result<WindowDecision> {
        let key = self.key(key);
        let window_start = (now_ms - window.as_millis() as i64) as f64;
        let mut data = self.data.lock().await;
        data.zrem_range(&key, f64::NEG_INFINITY, window_start)?;
        let count = data.zset(&key)?.map_or(0, |z| z.len() as u64);
        if count >= limit {
            return Ok(WindowDecision {
                allowed: false,
                count,
            });
        }
        data.apply(KeyOp::zadd(key.clone(), member, now_ms as f64))?;
        data.apply(KeyOp::expire(key, window))?;
        Ok(WindowDecision {
            allowed: true,
            count: count + 1,
        })
    }

    async fn transaction(&self, ops: Vec<KeyOp>) -> Result<()> {
        let ops: Vec<KeyOp> = ops.into_iter().map(|op| self.namespace_op(op)).collect();
        let mut data = self.data.lock().await;
        let staged = data.stage(&ops)?;
        data.commit(staged);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error, matching PUBLISH semantics
        let _ = self.sender(channel).await.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.sender(channel).await.subscribe();
        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

impl MemoryKeyspace {
    fn namespace_op(&self, op: KeyOp) -> KeyOp {
        match op {
            KeyOp::Set { key, value, ttl } => KeyOp::Set {
                key: self.key(&key),
                value,
                ttl,
            },
            KeyOp::Del { key } => KeyOp::Del { key: self.key(&key) },
            KeyOp::ZAdd { key, member, score } => KeyOp::ZAdd {
                key: self.key(&key),
                member,
                score,
            },
            KeyOp::ZRem { key, member } => KeyOp::ZRem {
                key: self.key(&key),
                member,
            },
            KeyOp::SAdd { key, member } => KeyOp::SAdd {
                key: self.key(&key),
                member,
            },
            KeyOp::SRem { key, member } => KeyOp::SRem {
                key: self.key(&key),
                member,
            },
            KeyOp::Expire { key, ttl } => KeyOp::Expire {
                key: self.key(&key),
                ttl,
            },
        }
    }
}
