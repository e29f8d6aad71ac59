//! Durable priority job queue
//!
//! Layout under `queue:<name>:` in the shared keyspace:
//!
//! ```text
//! pending      ZSET  id -> priority score (10 high, 5 normal, 1 low)
//! scheduled    ZSET  id -> due time (unix ms)
//! processing   SET   ids claimed by workers
//! completed    ZSET  id -> completion time (unix ms)
//! failed       ZSET  id -> failure time (unix ms)
//! job:<id>     JSON  QueuedJob record, 7 day ttl
//! dedupe:<key> id of the outstanding job, 24h ttl
//! ```
//!
//! Claiming an item takes a `queue_item` lease valued with the worker id,
//! then moves the id from `pending` to `processing` atomically. A worker that
//! loses either race gets `None`. Leases are heartbeated while the job runs;
//! an item whose lease lapses is returned to `pending` by [`JobQueue::recover_expired`].

mod types;


pub use types::{
    EnqueueRequest, FailOutcome, JobPriority, QueueConfig, QueueError, QueueStats, QueuedJob,
    QueuedJobStatus, Result,
};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keyspace::{KeyOp, KeyspaceStore, Slot};
use crate::locks::{Lease, LockError, LockManager, ResourceType};
use crate::utils::exponential_backoff;

fn millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Priority queue with scheduled retries and dedupe
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn KeyspaceStore>,
    locks: LockManager,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a queue
    pub fn new(store: Arc<dyn KeyspaceStore>, locks: LockManager, config: QueueConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn key(&self, part: &str) -> String {
        format!("queue:{}:{}", self.config.name, part)
    }

    fn record_key(&self, id: Uuid) -> String {
        self.key(&format!("job:{}", id))
    }

    fn dedupe_key(&self, dedupe: &str) -> String {
        self.key(&format!("dedupe:{}", dedupe))
    }

    fn record_op(&self, job: &QueuedJob) -> Result<KeyOp> {
        Ok(KeyOp::set(
            self.record_key(job.id),
            serde_json::to_string(job)?,
            Some(self.config.record_ttl),
        ))
    }

    /// Add a job
    ///
    /// With a dedupe key, the key is claimed atomically before anything else
    /// is written; a collision returns [`QueueError::DuplicateJob`] and
    /// creates nothing.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<QueuedJob> {
        let now = Utc::now();
        let job = QueuedJob {
            id: Uuid::new_v4(),
            job_type: request.job_type,
            payload: request.payload,
            priority: request.priority,
            status: QueuedJobStatus::Pending,
            retry_count: 0,
            max_retries: request
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            dedupe_key: request.dedupe_key,
            scheduled_at: request.scheduled_at,
            created_at: now,
            started_at: None,
            completed_at: None,
            locked_by: None,
            lease_until: None,
            error: None,
            result: None,
        };

        if let Some(dedupe) = &job.dedupe_key {
            let key = self.dedupe_key(dedupe);
            if !self
                .store
                .set_nx(&key, &job.id.to_string(), self.config.dedupe_ttl)
                .await?
            {
                let existing_id = self
                    .store
                    .get(&key)
                    .await?
                    .and_then(|id| Uuid::parse_str(&id).ok());
                debug!(dedupe_key = %dedupe, existing = ?existing_id, "Duplicate enqueue rejected");
                return Err(QueueError::DuplicateJob {
                    dedupe_key: dedupe.clone(),
                    existing_id,
                });
            }
        }

        let placement = match job.scheduled_at {
            Some(at) if at > now => KeyOp::zadd(self.key("scheduled"), job.id.to_string(), millis(at)),
            _ => KeyOp::zadd(self.key("pending"), job.id.to_string(), job.priority.score()),
        };

        let write = async {
            let record = self.record_op(&job)?;
            self.store.transaction(vec![record, placement]).await?;
            Ok::<(), QueueError>(())
        };
        if let Err(e) = write.await {
            if let Some(dedupe) = &job.dedupe_key {
                if let Err(release) = self
                    .store
                    .compare_and_delete(&self.dedupe_key(dedupe), &job.id.to_string())
                    .await
                {
                    warn!(dedupe_key = %dedupe, error = %release, "Failed to release dedupe key after enqueue error");
                }
            }
            return Err(e);
        }

        debug!(
            queue = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            priority = ?job.priority,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Read a job record
    pub async fn get(&self, id: Uuid) -> Result<QueuedJob> {
        let raw = self
            .store
            .get(&self.record_key(id))
            .await?
            .ok_or(QueueError::NotFound(id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Move due scheduled items into pending
    pub async fn promote_due(&self) -> Result<usize> {
        let scheduled = self.key("scheduled");
        let pending = self.key("pending");
        let due = self
            .store
            .zrange_by_score(
                &scheduled,
                f64::NEG_INFINITY,
                millis(Utc::now()),
                Some(self.config.promote_batch),
            )
            .await?;

        let mut promoted = 0;
        for (member, _) in due {
            let priority = match Uuid::parse_str(&member) {
                Ok(id) => match self.get(id).await {
                    Ok(job) => job.priority,
                    Err(QueueError::NotFound(_)) => {
                        warn!(job_id = %member, "Dropping scheduled entry without record");
                        self.store.zrem(&scheduled, &member).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Err(_) => {
                    self.store.zrem(&scheduled, &member).await?;
                    continue;
                }
            };

            if self
                .store
                .move_member(
                    Slot::Sorted(&scheduled),
                    Slot::Sorted(&pending),
                    &member,
                    priority.score(),
                )
                .await?
            {
                promoted += 1;
            }
        }

        if promoted > 0 {
            debug!(queue = %self.config.name, count = promoted, "Promoted scheduled jobs");
        }
        Ok(promoted)
    }

    /// Claim the highest-priority pending job
    ///
    /// Returns `None` when the queue is empty or another worker won the claim.
    pub async fn dequeue(&self, worker_id: &str, lease: Duration) -> Result<Option<QueuedJob>> {
        self.promote_due().await?;

        let pending = self.key("pending");
        let processing = self.key("processing");
        let Some(member) = self.store.ztop(&pending).await? else {
            return Ok(None);
        };

        let item_lease = match self
            .locks
            .acquire_as(ResourceType::QueueItem, &member, worker_id, lease)
            .await
        {
            Ok(l) => l,
            Err(LockError::NotAcquired(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !self
            .store
            .move_member(
                Slot::Sorted(&pending),
                Slot::Unsorted(&processing),
                &member,
                0.0,
            )
            .await?
        {
            // Completed by its previous holder between our read and our claim
            self.drop_claim(&item_lease).await;
            return Ok(None);
        }

        let id = match Uuid::parse_str(&member) {
            Ok(id) => id,
            Err(_) => {
                self.store.srem(&processing, &member).await?;
                self.drop_claim(&item_lease).await;
                return Ok(None);
            }
        };
        let mut job = match self.get(id).await {
            Ok(job) => job,
            Err(QueueError::NotFound(_)) => {
                warn!(job_id = %id, "Claimed job has no record, dropping");
                self.store.srem(&processing, &member).await?;
                self.drop_claim(&item_lease).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        job.status = QueuedJobStatus::Processing;
        job.started_at = Some(now);
        job.locked_by = Some(worker_id.to_string());
        job.lease_until = Some(now + span(lease));
        self.store.transaction(vec![self.record_op(&job)?]).await?;

        debug!(queue = %self.config.name, job_id = %job.id, worker = %worker_id, "Job claimed");
        Ok(Some(job))
    }

    async fn drop_claim(&self, lease: &Lease) {
        if let Err(e) = self.locks.release(lease).await {
            warn!(queue = %self.config.name, resource = %lease.resource_id, error = %e, "Failed to release abandoned claim");
        }
    }

    /// Prolong the processing lease of a claimed job
    pub async fn heartbeat(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<()> {
        self.locks
            .extend_owned(ResourceType::QueueItem, &id.to_string(), worker_id, lease)
            .await?;
        Ok(())
    }

    async fn release_lease(&self, job: &QueuedJob) {
        let Some(owner) = job.locked_by.as_deref() else {
            return;
        };
        if let Err(e) = self
            .locks
            .release_owned(ResourceType::QueueItem, &job.id.to_string(), owner)
            .await
        {
            debug!(job_id = %job.id, error = %e, "Processing lease already gone");
        }
    }

    /// Read a job `worker_id` has claimed
    ///
    /// A worker whose lease lapsed and whose item was recovered, or claimed
    /// again, gets [`LockError::NotOwned`].
    async fn claimed(&self, id: Uuid, worker_id: &str) -> Result<QueuedJob> {
        let job = self.get(id).await?;
        if job.status != QueuedJobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Err(LockError::NotOwned(format!("queue item {} for {}", id, worker_id)).into());
        }
        Ok(job)
    }

    /// Ops removing `id` from every non-terminal structure
    fn detach_ops(&self, id: Uuid) -> Vec<KeyOp> {
        let member = id.to_string();
        vec![
            KeyOp::zrem(self.key("pending"), member.clone()),
            KeyOp::zrem(self.key("scheduled"), member.clone()),
            KeyOp::srem(self.key("processing"), member),
        ]
    }

    /// Mark a job `worker_id` holds completed
    pub async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<QueuedJob> {
        let mut job = self.claimed(id, worker_id).await?;
        let holder = job.clone();
        let now = Utc::now();

        job.status = QueuedJobStatus::Completed;
        job.completed_at = Some(now);
        job.result = result;
        job.error = None;
        job.locked_by = None;
        job.lease_until = None;

        let mut ops = self.detach_ops(id);
        ops.push(KeyOp::zadd(self.key("completed"), id.to_string(), millis(now)));
        ops.push(self.record_op(&job)?);
        self.store.transaction(ops).await?;

        self.release_dedupe(&job).await;
        self.release_lease(&holder).await;

        debug!(queue = %self.config.name, job_id = %id, "Job completed");
        Ok(job)
    }

    /// Record a failed attempt by the worker holding the job
    ///
    /// Below the retry budget the job moves to `scheduled` with backoff
    /// `min(base * 2^retry_count, cap)`; otherwise it moves to `failed`.
    pub async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> Result<FailOutcome> {
        let mut job = self.claimed(id, worker_id).await?;
        let holder = job.clone();
        let now = Utc::now();

        job.retry_count += 1;
        job.error = Some(error.to_string());
        job.locked_by = None;
        job.lease_until = None;

        let mut ops = self.detach_ops(id);
        let outcome = if job.retry_count < job.max_retries {
            let backoff = exponential_backoff(
                job.retry_count,
                self.config.backoff_base,
                self.config.backoff_cap,
            );
            let scheduled_at = now + span(backoff);
            job.status = QueuedJobStatus::Retrying;
            job.scheduled_at = Some(scheduled_at);
            ops.push(KeyOp::zadd(
                self.key("scheduled"),
                id.to_string(),
                millis(scheduled_at),
            ));
            FailOutcome::Retrying {
                retry_count: job.retry_count,
                scheduled_at,
            }
        } else {
            job.status = QueuedJobStatus::Failed;
            job.completed_at = Some(now);
            ops.push(KeyOp::zadd(self.key("failed"), id.to_string(), millis(now)));
            FailOutcome::Failed {
                retry_count: job.retry_count,
            }
        };
        ops.push(self.record_op(&job)?);
        self.store.transaction(ops).await?;

        if job.status == QueuedJobStatus::Failed {
            self.release_dedupe(&job).await;
        }
        self.release_lease(&holder).await;

        match outcome {
            FailOutcome::Retrying {
                retry_count,
                scheduled_at,
            } => info!(
                queue = %self.config.name,
                job_id = %id,
                retry_count,
                scheduled_at = %scheduled_at,
                error = %error,
                "Job failed, retry scheduled"
            ),
            FailOutcome::Failed { retry_count } => warn!(
                queue = %self.config.name,
                job_id = %id,
                retry_count,
                error = %error,
                "Job failed permanently"
            ),
        }
        Ok(outcome)
    }

    /// Put a claimed job back without spending a retry
    ///
    /// Used when the job could not start for reasons unrelated to its own
    /// correctness, such as lock contention on the resources it needs.
    pub async fn reschedule(&self, id: Uuid, worker_id: &str, delay: Duration) -> Result<QueuedJob> {
        let mut job = self.claimed(id, worker_id).await?;
        let holder = job.clone();
        let at = Utc::now() + span(delay);

        job.status = QueuedJobStatus::Pending;
        job.scheduled_at = Some(at);
        job.locked_by = None;
        job.lease_until = None;

        let mut ops = self.detach_ops(id);
        ops.push(KeyOp::zadd(self.key("scheduled"), id.to_string(), millis(at)));
        ops.push(self.record_op(&job)?);
        self.store.transaction(ops).await?;
        self.release_lease(&holder).await;

        debug!(queue = %self.config.name, job_id = %id, delay_ms = delay.as_millis() as u64, "Job rescheduled");
        Ok(job)
    }

    /// Return processing items whose lease lapsed to `pending`
    pub async fn recover_expired(&self) -> Result<usize> {
        let processing = self.key("processing");
        let pending = self.key("pending");
        let mut recovered = 0;

        for member in self.store.smembers(&processing).await? {
            if self
                .locks
                .is_locked(ResourceType::QueueItem, &member)
                .await?
            {
                continue;
            }

            let Ok(id) = Uuid::parse_str(&member) else {
                self.store.srem(&processing, &member).await?;
                continue;
            };
            let mut job = match self.get(id).await {
                Ok(job) => job,
                Err(QueueError::NotFound(_)) => {
                    self.store.srem(&processing, &member).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !self
                .store
                .move_member(
                    Slot::Unsorted(&processing),
                    Slot::Sorted(&pending),
                    &member,
                    job.priority.score(),
                )
                .await?
            {
                continue;
            }

            warn!(
                queue = %self.config.name,
                job_id = %id,
                worker = ?job.locked_by,
                "Processing lease expired, job returned to pending"
            );
            job.status = QueuedJobStatus::Pending;
            job.locked_by = None;
            job.lease_until = None;
            self.store.transaction(vec![self.record_op(&job)?]).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Drop terminal jobs finished before `older_than`
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for set in ["completed", "failed"] {
            let key = self.key(set);
            let stale = self
                .store
                .zrange_by_score(&key, f64::NEG_INFINITY, millis(older_than), None)
                .await?;
            for (member, _) in stale {
                let mut ops = vec![KeyOp::zrem(key.clone(), member.clone())];
                if let Ok(id) = Uuid::parse_str(&member) {
                    ops.push(KeyOp::del(self.record_key(id)));
                }
                self.store.transaction(ops).await?;
                purged += 1;
            }
        }

        if purged > 0 {
            info!(queue = %self.config.name, count = purged, "Purged terminal jobs");
        }
        Ok(purged)
    }

    /// Counts per structure
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.store.zcard(&self.key("pending")).await?,
            scheduled: self.store.zcard(&self.key("scheduled")).await?,
            processing: self.store.scard(&self.key("processing")).await?,
            completed: self.store.zcard(&self.key("completed")).await?,
            failed: self.store.zcard(&self.key("failed")).await?,
        })
    }

    /// Whether `id` is in the named structure
    pub async fn contains(&self, structure: &str, id: Uuid) -> Result<bool> {
        let key = self.key(structure);
        let member = id.to_string();
        if structure == "processing" {
            Ok(self.store.smembers(&key).await?.contains(&member))
        } else {
            Ok(self.store.zscore(&key, &member).await?.is_some())
        }
    }

    async fn release_dedupe(&self, job: &QueuedJob) {
        let Some(dedupe) = &job.dedupe_key else {
            return;
        };
        // Only clear the key if it still points at this job
        if let Err(e) = self
            .store
            .compare_and_delete(&self.dedupe_key(dedupe), &job.id.to_string())
            .await
        {
            warn!(job_id = %job.id, dedupe_key = %dedupe, error = %e, "Failed to release dedupe key");
        }
    }
}
