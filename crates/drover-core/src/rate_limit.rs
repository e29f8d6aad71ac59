//! Sliding-window rate limiting per (platform, account)
//!
//! Every recorded action is one timestamped member of the sorted set
//! `ratelimit:<platform>:<account>`. Entries older than the policy window are
//! trimmed before counting, so the count is always derived and expiry is
//! self-correcting. The window lives in the shared keyspace because every
//! worker in the pool may act on the same account.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::keyspace::{KeyOp, KeyspaceError, KeyspaceStore};
use crate::platform::Platform;

#[cfg(test)]
mod tests;

/// Default interval between quota polls in [`RateLimiter::wait_for_quota`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Rate limit policy for one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Sliding window length
    #[serde(with = "duration_secs")]
    pub window: Duration,
    /// Sustained actions per window
    pub max_tokens: u64,
    /// Extra actions tolerated on top of `max_tokens`
    pub burst: u64,
}

impl RatePolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(window: Duration, max_tokens: u64, burst: u64) -> Self {
        Self {
            window,
            max_tokens,
            burst,
        }
    }

    /// Hard cap on actions in any trailing window
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.max_tokens + self.burst
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.001)))
    }
}

/// Per-platform policy table
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<Platform, RatePolicy>,
    fallback: RatePolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let policies = HashMap::from([
            (Platform::Farcaster, RatePolicy::new(minute, 20, 5)),
            (Platform::Telegram, RatePolicy::new(Duration::from_secs(1), 25, 5)),
            (Platform::Twitter, RatePolicy::new(Duration::from_secs(15 * 60), 15, 0)),
            (Platform::Discord, RatePolicy::new(minute, 50, 10)),
        ]);
        Self {
            policies,
            fallback: RatePolicy::new(minute, 30, 5),
        }
    }
}

impl PolicyTable {
    /// Override one platform's policy
    #[must_use]
    pub fn with_policy(mut self, platform: Platform, policy: RatePolicy) -> Self {
        self.policies.insert(platform, policy);
        self
    }

    /// Override the policy for platforms without their own entry
    #[must_use]
    pub fn with_fallback(mut self, policy: RatePolicy) -> Self {
        self.fallback = policy;
        self
    }

    /// Policy that applies to `platform`
    #[must_use]
    pub fn get(&self, platform: Platform) -> RatePolicy {
        self.policies.get(&platform).copied().unwrap_or(self.fallback)
    }
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Quota exhausted for the window
    #[error("rate limited on {platform} for account {account_id}, retry in {retry_after:?}")]
    RateLimited {
        /// Platform
        platform: Platform,
        /// Account
        account_id: String,
        /// Time until the oldest entry leaves the window
        retry_after: Duration,
    },

    /// Keyspace failure
    #[error(transparent)]
    Store(#[from] KeyspaceError),
}

/// Result type for rate limiter operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Snapshot of one account's window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    /// Platform
    pub platform: Platform,
    /// Account
    pub account_id: String,
    /// Actions in the current window
    pub used: u64,
    /// `max_tokens + burst`
    pub limit: u64,
    /// Actions left before hitting the limit
    pub remaining: u64,
    /// Time until the oldest entry leaves the window
    pub reset_after: Duration,
}

/// Centralised sliding-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyspaceStore>,
    policies: PolicyTable,
    poll_interval: Duration,
}

impl RateLimiter {
    /// Create a rate limiter with the default policy table
    pub fn new(store: Arc<dyn KeyspaceStore>) -> Self {
        Self {
            store,
            policies: PolicyTable::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Replace the policy table
    #[must_use]
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Set the quota poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Policy that applies to `platform`
    #[must_use]
    pub fn policy(&self, platform: Platform) -> RatePolicy {
        self.policies.get(platform)
    }

    fn key(platform: Platform, account_id: &str) -> String {
        format!("ratelimit:{}:{}", platform, account_id)
    }

    /// Trim expired entries and return the live count
    async fn current_count(&self, platform: Platform, account_id: &str) -> Result<u64> {
        let key = Self::key(platform, account_id);
        let policy = self.policy(platform);
        let window_start = Utc::now().timestamp_millis() - policy.window.as_millis() as i64;

        self.store
            .zrem_range_by_score(&key, f64::NEG_INFINITY, window_start as f64)
            .await?;
        Ok(self.store.zcard(&key).await?)
    }

    /// Whether one more action is allowed now
    pub async fn check_quota(&self, platform: Platform, account_id: &str) -> Result<bool> {
        let count = self.current_count(platform, account_id).await?;
        Ok(count < self.policy(platform).limit())
    }

    /// Record one action at the current time
    pub async fn record_action(&self, platform: Platform, account_id: &str) -> Result<()> {
        let key = Self::key(platform, account_id);
        let now = Utc::now().timestamp_millis();
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        self.store
            .transaction(vec![
                KeyOp::zadd(key.clone(), member, now as f64),
                KeyOp::expire(key, self.policy(platform).window),
            ])
            .await?;
        Ok(())
    }

    /// Check and record in one atomic step
    ///
    /// Returns `RateLimited` without recording when the window is full. This
    /// is what the execution engine uses, so the window bound holds even when
    /// several workers race on one account.
    pub async fn try_acquire(&self, platform: Platform, account_id: &str) -> Result<()> {
        let key = Self::key(platform, account_id);
        let policy = self.policy(platform);
        let now = Utc::now().timestamp_millis();
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        let decision = self
            .store
            .window_acquire(&key, now, policy.window, policy.limit(), &member)
            .await?;
        if decision.allowed {
            debug!(platform = %platform, account_id = %account_id, used = decision.count, "Quota consumed");
            return Ok(());
        }

        Err(RateLimitError::RateLimited {
            platform,
            account_id: account_id.to_string(),
            retry_after: self.reset_after(platform, account_id).await?,
        })
    }

    /// Actions left in the current window
    pub async fn remaining_quota(&self, platform: Platform, account_id: &str) -> Result<u64> {
        let count = self.current_count(platform, account_id).await?;
        Ok(self.policy(platform).limit().saturating_sub(count))
    }

    /// Time until the oldest entry leaves the window
    async fn reset_after(&self, platform: Platform, account_id: &str) -> Result<Duration> {
        let key = Self::key(platform, account_id);
        let policy = self.policy(platform);
        let oldest = self
            .store
            .zrange_by_score(&key, f64::NEG_INFINITY, f64::INFINITY, Some(1))
            .await?;

        let Some((_, score)) = oldest.into_iter().next() else {
            return Ok(Duration::ZERO);
        };
        let expires_at = score as i64 + policy.window.as_millis() as i64;
        let remaining_ms = (expires_at - Utc::now().timestamp_millis()).max(0);
        Ok(Duration::from_millis(remaining_ms as u64))
    }

    /// Full snapshot of an account's window
    pub async fn status(&self, platform: Platform, account_id: &str) -> Result<QuotaStatus> {
        let used = self.current_count(platform, account_id).await?;
        let limit = self.policy(platform).limit();
        Ok(QuotaStatus {
            platform,
            account_id: account_id.to_string(),
            used,
            limit,
            remaining: limit.saturating_sub(used),
            reset_after: self.reset_after(platform, account_id).await?,
        })
    }

    /// Poll until quota frees up or `max_wait` elapses
    pub async fn wait_for_quota(
        &self,
        platform: Platform,
        account_id: &str,
        max_wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.check_quota(platform, account_id).await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RateLimitError::RateLimited {
                    platform,
                    account_id: account_id.to_string(),
                    retry_after: self.reset_after(platform, account_id).await?,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Forget every recorded action for the account
    pub async fn reset(&self, platform: Platform, account_id: &str) -> Result<()> {
        self.store.del(&Self::key(platform, account_id)).await?;
        info!(platform = %platform, account_id = %account_id, "Rate limit window reset");
        Ok(())
    }
}
