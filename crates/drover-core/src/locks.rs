//! Distributed leases over named resources
//!
//! A lease is a token-guarded key `lock:<resource_type>:<resource_id>` in the
//! shared keyspace. Acquisition is a single set-if-absent with ttl; release and
//! extension compare the stored token atomically, so a holder whose lease
//! already expired can never delete or prolong someone else's.
//!
//! Every code path that mutates a shared resource goes through
//! [`LockManager::with_lock`] (or holds a [`LeaseSet`]) so the lease is
//! released on every exit path. The ttl bounds recovery when a holder crashes.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::keyspace::{KeyspaceError, KeyspaceStore};
use crate::utils::RetryConfig;

#[cfg(test)]
mod tests;

/// Kinds of lockable resources
///
/// The declaration order is the acquisition order used by [`LockManager::acquire_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    /// A wallet (signing, balance sync)
    Wallet,
    /// A social account
    Account,
    /// A browser session profile
    Browser,
    /// A campaign task template
    Task,
    /// A campaign
    Campaign,
    /// A scheduled job definition
    Job,
    /// A claimed queue item (value is the owning worker id)
    QueueItem,
}

impl ResourceType {
    /// Key segment for this resource type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::Account => "account",
            Self::Browser => "browser",
            Self::Task => "task",
            Self::Campaign => "campaign",
            Self::Job => "job",
            Self::QueueItem => "queue_item",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock error types
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Someone else holds the lease
    #[error("lock not acquired: {0}")]
    NotAcquired(String),

    /// Release attempted with a token that no longer matches
    #[error("lock not owned: {0}")]
    NotOwned(String),

    /// Extension attempted after the lease lapsed or changed hands
    #[error("lock expired: {0}")]
    Expired(String),

    /// Keyspace failure
    #[error(transparent)]
    Store(#[from] KeyspaceError),
}

impl LockError {
    /// Contention rather than infrastructure failure
    #[must_use]
    pub fn is_contention(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Result type for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// A held lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Resource type
    pub resource_type: ResourceType,
    /// Resource identifier
    pub resource_id: String,
    /// Owner token stored under the key
    pub token: String,
    /// Requested time to live
    pub ttl: Duration,
    /// When the lease was taken or last extended
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Keyspace key of this lease
    #[must_use]
    pub fn key(&self) -> String {
        lock_key(self.resource_type, &self.resource_id)
    }

    /// Human readable `type:id`
    #[must_use]
    pub fn resource(&self) -> String {
        format!("{}:{}", self.resource_type, self.resource_id)
    }
}

fn lock_key(resource_type: ResourceType, resource_id: &str) -> String {
    format!("lock:{}:{}", resource_type, resource_id)
}

/// Lease manager over the shared keyspace
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyspaceStore>,
    backoff: RetryConfig,
}

impl LockManager {
    /// Create a lock manager
    pub fn new(store: Arc<dyn KeyspaceStore>) -> Self {
        Self {
            store,
            backoff: RetryConfig::lock_acquire(),
        }
    }

    /// Override the contention backoff
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Try once to take a lease with a fresh random token
    pub async fn acquire(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<Lease> {
        let token = Uuid::new_v4().to_string();
        self.acquire_as(resource_type, resource_id, &token, ttl).await
    }

    /// Try once to take a lease with a caller-chosen owner token
    pub async fn acquire_as(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease> {
        let key = lock_key(resource_type, resource_id);
        if !self.store.set_nx(&key, owner, ttl).await? {
            return Err(LockError::NotAcquired(format!(
                "{}:{}",
                resource_type, resource_id
            )));
        }

        debug!(resource = %key, ttl_ms = ttl.as_millis() as u64, "Lease acquired");
        Ok(Lease {
            resource_type,
            resource_id: resource_id.to_string(),
            token: owner.to_string(),
            ttl,
            acquired_at: Utc::now(),
        })
    }

    /// Keep trying to take a lease until `max_wait` elapses
    ///
    /// Backs off exponentially from 50ms up to 500ms with jitter between
    /// attempts. The final attempt happens no later than the deadline.
    pub async fn acquire_with_retry(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<Lease> {
        let deadline = Instant::now() + max_wait;
        let mut attempt = 1;

        loop {
            match self.acquire(resource_type, resource_id, ttl).await {
                Err(LockError::NotAcquired(resource)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(resource = %resource, attempts = attempt, "Lease wait timed out");
                        return Err(LockError::NotAcquired(resource));
                    }
                    let delay = self.backoff.delay_for(attempt).min(deadline - now);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Release a lease if its token still matches
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        if self
            .store
            .compare_and_delete(&lease.key(), &lease.token)
            .await?
        {
            debug!(resource = %lease.resource(), "Lease released");
            Ok(())
        } else {
            Err(LockError::NotOwned(lease.resource()))
        }
    }

    /// Release by resource and owner token
    pub async fn release_owned(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        owner: &str,
    ) -> Result<()> {
        let key = lock_key(resource_type, resource_id);
        if self.store.compare_and_delete(&key, owner).await? {
            Ok(())
        } else {
            Err(LockError::NotOwned(format!("{}:{}", resource_type, resource_id)))
        }
    }

    /// Prolong a lease if its token still matches
    pub async fn extend(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
        if !self
            .store
            .compare_and_expire(&lease.key(), &lease.token, ttl)
            .await?
        {
            return Err(LockError::Expired(lease.resource()));
        }
        lease.ttl = ttl;
        lease.acquired_at = Utc::now();
        Ok(())
    }

    /// Prolong by resource and owner token
    pub async fn extend_owned(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<()> {
        let key = lock_key(resource_type, resource_id);
        if self.store.compare_and_expire(&key, owner, ttl).await? {
            Ok(())
        } else {
            Err(LockError::Expired(format!("{}:{}", resource_type, resource_id)))
        }
    }

    /// Whether anyone currently holds the resource
    pub async fn is_locked(&self, resource_type: ResourceType, resource_id: &str) -> Result<bool> {
        Ok(self
            .store
            .exists(&lock_key(resource_type, resource_id))
            .await?)
    }

    /// Acquire once, run `work`, release
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        ttl: Duration,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LockError>,
    {
        let lease = self.acquire(resource_type, resource_id, ttl).await?;
        let result = work().await;
        self.release_quietly(&lease).await;
        result
    }

    /// Acquire with retry, run `work`, release
    pub async fn with_lock_retry<T, E, F, Fut>(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        ttl: Duration,
        max_wait: Duration,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LockError>,
    {
        let lease = self
            .acquire_with_retry(resource_type, resource_id, ttl, max_wait)
            .await?;
        let result = work().await;
        self.release_quietly(&lease).await;
        result
    }

    /// Acquire several leases in a fixed global order
    ///
    /// Requests are sorted by resource type then id and deduplicated, so two
    /// callers needing the same set never deadlock against each other. If any
    /// lease cannot be taken within `max_wait`, the ones already held are
    /// released before returning.
    pub async fn acquire_all(
        &self,
        mut requests: Vec<(ResourceType, String)>,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LeaseSet> {
        requests.sort();
        requests.dedup();

        let deadline = Instant::now() + max_wait;
        let mut set = LeaseSet {
            manager: self.clone(),
            leases: Vec::with_capacity(requests.len()),
        };

        for (resource_type, resource_id) in requests {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .acquire_with_retry(resource_type, &resource_id, ttl, remaining)
                .await
            {
                Ok(lease) => set.leases.push(lease),
                Err(e) => {
                    set.release_all().await;
                    return Err(e);
                }
            }
        }

        Ok(set)
    }

    async fn release_quietly(&self, lease: &Lease) {
        if let Err(e) = self.release(lease).await {
            warn!(resource = %lease.resource(), error = %e, "Lease release failed, ttl will reclaim it");
        }
    }
}

/// Leases held together and released together
///
/// Dropping a set that was not released spawns the release in the background
/// when a runtime is available; the ttl covers the rest.
pub struct LeaseSet {
    manager: LockManager,
    leases: Vec<Lease>,
}

impl LeaseSet {
    /// Held leases in acquisition order
    #[must_use]
    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    /// Whether the set holds no leases
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Extend every lease
    pub async fn extend_all(&mut self, ttl: Duration) -> Result<()> {
        for lease in &mut self.leases {
            self.manager.extend(lease, ttl).await?;
        }
        Ok(())
    }

    /// Release every lease, in reverse acquisition order
    pub async fn release_all(mut self) {
        let leases = std::mem::take(&mut self.leases);
        for lease in leases.iter().rev() {
            self.manager.release_quietly(lease).await;
        }
    }
}

impl Drop for LeaseSet {
    fn drop(&mut self) {
        if self.leases.is_empty() {
            return;
        }
        let leases = std::mem::take(&mut self.leases);
        let manager = self.manager.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for lease in leases.iter().rev() {
                        manager.release_quietly(lease).await;
                    }
                });
            }
            Err(_) => {
                warn!(count = leases.len(), "Leases dropped outside a runtime, waiting for ttl");
            }
        }
    }
}
