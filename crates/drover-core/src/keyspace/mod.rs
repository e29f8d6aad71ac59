//! Shared keyspace store
//!
//! The keyspace store is the single source of truth for locks, rate-limit
//! windows and queue state. Two backends are provided:
//!
//! - [`MemoryKeyspace`]: in-process, for tests and single-node development
//! - [`RedisKeyspace`]: Redis, for every multi-process deployment
//!
//! Compound read-modify-write operations (`compare_and_delete`,
//! `compare_and_expire`, `window_acquire`, `move_member`) are atomic on both
//! backends. On Redis they run as server-side Lua scripts.

mod memory;
mod redis_store;


pub use memory::MemoryKeyspace;
pub use redis_store::RedisKeyspace;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Keyspace error type
#[derive(Debug, thiserror::Error)]
pub enum KeyspaceError {
    /// Could not reach the store
    #[error("keyspace connection error: {0}")]
    Connection(String),

    /// A command was rejected or failed
    #[error("keyspace command error: {0}")]
    Command(String),

    /// Key holds a value of another kind
    #[error("wrong value type at key {0}")]
    WrongType(String),
}

impl KeyspaceError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type for keyspace operations
pub type Result<T> = std::result::Result<T, KeyspaceError>;

/// One write inside an atomic [`KeyspaceStore::transaction`]
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOp {
    /// Set a string value, optionally with a ttl
    Set {
        /// Key
        key: String,
        /// Value
        value: String,
        /// Time to live
        ttl: Option<Duration>,
    },
    /// Delete a key of any kind
    Del {
        /// Key
        key: String,
    },
    /// Add or re-score a sorted-set member
    ZAdd {
        /// Sorted set key
        key: String,
        /// Member
        member: String,
        /// Score
        score: f64,
    },
    /// Remove a sorted-set member
    ZRem {
        /// Sorted set key
        key: String,
        /// Member
        member: String,
    },
    /// Add a set member
    SAdd {
        /// Set key
        key: String,
        /// Member
        member: String,
    },
    /// Remove a set member
    SRem {
        /// Set key
        key: String,
        /// Member
        member: String,
    },
    /// Set the ttl of an existing key
    Expire {
        /// Key
        key: String,
        /// Time to live
        ttl: Duration,
    },
}

impl KeyOp {
    /// Set a string value
    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    /// Delete a key
    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    /// Add a sorted-set member
    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        Self::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    /// Remove a sorted-set member
    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    /// Add a set member
    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    /// Remove a set member
    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    /// Set a ttl
    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        Self::Expire {
            key: key.into(),
            ttl,
        }
    }

    /// Key the write touches
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Del { key }
            | Self::ZAdd { key, .. }
            | Self::ZRem { key, .. }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. }
            | Self::Expire { key, .. } => key,
        }
    }
}

/// A sorted or unsorted set holding queue members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<'a> {
    /// Sorted set key
    Sorted(&'a str),
    /// Set key
    Unsorted(&'a str),
}

impl<'a> Slot<'a> {
    /// Key of the collection
    #[must_use]
    pub fn key(&self) -> &'a str {
        match *self {
            Self::Sorted(k) | Self::Unsorted(k) => k,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::Sorted(_) => "z",
            Self::Unsorted(_) => "s",
        }
    }
}

/// Outcome of [`KeyspaceStore::window_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the entry was recorded
    pub allowed: bool,
    /// Entries in the window after the call
    pub count: u64,
}

/// Shared keyspace store
///
/// Implementations prefix every key and channel with their deployment
/// namespace, so callers only ever see the logical layout.
#[async_trait]
pub trait KeyspaceStore: Send + Sync {
    /// Backend name for logging
    fn backend(&self) -> &'static str;

    /// Read a string value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write a string value only if the key is absent
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key, returning whether it existed
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining ttl, `None` if the key is missing or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Delete `key` only if it currently holds `token`
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool>;

    /// Reset the ttl of `key` only if it currently holds `token`
    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Add or re-score a sorted-set member
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove a sorted-set member, returning whether it was present
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Score of a sorted-set member
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>>;

    /// Highest-scored member
    async fn ztop(&self, key: &str) -> Result<Option<String>>;

    /// Sorted-set cardinality
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Remove members with `min <= score <= max`
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// Add a set member, returning whether it was new
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a set member, returning whether it was present
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// Set cardinality
    async fn scard(&self, key: &str) -> Result<u64>;

    /// Set members
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Move `member` from one collection to another
    ///
    /// `score` is used when `to` is sorted. Returns false, touching nothing,
    /// when `member` was no longer in `from`; this is how competing workers
    /// find out they lost a race.
    async fn move_member(
        &self,
        from: Slot<'_>,
        to: Slot<'_>,
        member: &str,
        score: f64,
    ) -> Result<bool>;

    /// Sliding-window admission
    ///
    /// Trims entries older than `now_ms - window`, counts the rest and records
    /// `member` at `now_ms` only if the count is below `limit`. The key's ttl
    /// is refreshed to `window` on every admitted entry.
    async fn window_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> Result<WindowDecision>;

    /// Apply all writes atomically
    async fn transaction(&self, ops: Vec<KeyOp>) -> Result<()>;

    /// Publish a message
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

pub(crate) fn namespaced(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}:{}", ns, key),
        _ => key.to_string(),
    }
}
