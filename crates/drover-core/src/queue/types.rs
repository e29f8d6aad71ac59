//! Queue data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::keyspace::KeyspaceError;
use crate::locks::LockError;

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue error types
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Dedupe key already has an outstanding job
    #[error("duplicate job for dedupe key {dedupe_key}")]
    DuplicateJob {
        /// The dedupe key that collided
        dedupe_key: String,
        /// Id of the outstanding job, if still readable
        existing_id: Option<Uuid>,
    },

    /// No record for this id
    #[error("queued job not found: {0}")]
    NotFound(Uuid),

    /// Record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Per-item lease failure
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Keyspace failure
    #[error(transparent)]
    Store(#[from] KeyspaceError),
}

impl QueueError {
    /// Infrastructure failure that may clear on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Lock(LockError::Store(e)) => e.is_transient(),
            _ => false,
        }
    }
}

/// Queue priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Background work
    Low,
    /// Default
    #[default]
    Normal,
    /// Runs before everything else
    High,
}

impl JobPriority {
    /// Score in the pending set
    #[must_use]
    pub fn score(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Normal => 5.0,
            Self::High => 10.0,
        }
    }
}

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedJobStatus {
    /// Waiting in the pending or scheduled set
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Failed, waiting in the scheduled set for another attempt
    Retrying,
}

impl QueuedJobStatus {
    /// Completed or failed
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One enqueued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Unique per enqueue
    pub id: Uuid,
    /// Handler-defined type
    #[serde(rename = "type")]
    pub job_type: String,
    /// Handler-defined payload
    pub payload: serde_json::Value,
    /// Priority
    pub priority: JobPriority,
    /// Status
    pub status: QueuedJobStatus,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Failed attempts allowed before the job is terminally failed
    pub max_retries: u32,
    /// Dedupe key registered at enqueue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Not eligible before this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Enqueue time
    pub created_at: DateTime<Utc>,
    /// Last claim time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker holding the processing lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// Lease expiry as of the last claim or heartbeat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    /// Last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler result on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Parameters for [`JobQueue::enqueue`](super::JobQueue::enqueue)
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Handler-defined type
    pub job_type: String,
    /// Handler-defined payload
    pub payload: serde_json::Value,
    /// Priority
    pub priority: JobPriority,
    /// Retry budget, queue default when unset
    pub max_retries: Option<u32>,
    /// Delay eligibility until this time
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Reject while another job with this key is outstanding
    pub dedupe_key: Option<String>,
}

impl EnqueueRequest {
    /// New request with normal priority
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: JobPriority::Normal,
            max_retries: None,
            scheduled_at: None,
            dedupe_key: None,
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set retry budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Schedule for later
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Set dedupe key
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// What [`JobQueue::fail`](super::JobQueue::fail) did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled for another attempt
    Retrying {
        /// Failures so far
        retry_count: u32,
        /// Next eligibility
        scheduled_at: DateTime<Utc>,
    },
    /// Out of retries, moved to the failed set
    Failed {
        /// Failures so far
        retry_count: u32,
    },
}

/// Counts per queue structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready to claim
    pub pending: u64,
    /// Waiting for their due time
    pub scheduled: u64,
    /// Claimed by workers
    pub processing: u64,
    /// Completed (until purged)
    pub completed: u64,
    /// Terminally failed (until purged)
    pub failed: u64,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, the `<name>` in `queue:<name>:*`
    pub name: String,
    /// Retry budget when the request does not set one
    pub default_max_retries: u32,
    /// Lifetime of job records
    pub record_ttl: Duration,
    /// Lifetime of dedupe keys
    pub dedupe_ttl: Duration,
    /// Retry backoff base
    pub backoff_base: Duration,
    /// Retry backoff cap
    pub backoff_cap: Duration,
    /// Maximum scheduled items promoted per dequeue
    pub promote_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "jobs".to_string(),
            default_max_retries: 3,
            record_ttl: Duration::from_secs(7 * 24 * 3600),
            dedupe_ttl: Duration::from_secs(24 * 3600),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5 * 60),
            promote_batch: 100,
        }
    }
}

impl QueueConfig {
    /// Create a configuration for the named queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set default retry budget
    #[must_use]
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Set retry backoff base and cap
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Set dedupe key lifetime
    #[must_use]
    pub fn with_dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe_ttl = ttl;
        self
    }
}
