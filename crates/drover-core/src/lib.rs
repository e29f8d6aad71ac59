//! Drover Core - job scheduling and task execution
//!
//! This crate provides the engine behind Drover:
//! - Keyspace: shared low-latency store (in-memory or Redis)
//! - Locks: leases on wallets, accounts, browsers and jobs
//! - Rate limiting: sliding-window quotas per platform account
//! - Queue: priority job queue with retries, leases and dedupe
//! - Scheduler: cron timers, due-job checks and a worker pool
//! - Execution: idempotent campaign task execution with proofs
//! - Audit: durable, idempotent audit trail
//! - Platform: adapter and collaborator traits
//! - Events and shutdown plumbing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod db;
pub mod error;
pub mod event_bus;
pub mod execution;
pub mod keyspace;
pub mod locks;
pub mod platform;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod shutdown;
pub mod utils;

pub use audit::{AuditAction, AuditConfig, AuditEntry, AuditError, AuditLogger, AuditResult, AuditStore};
pub use db::Database;
pub use error::{format_error_for_cli, Error, Result, UserFriendlyError};
pub use event_bus::{EngineEvent, EventBus};
pub use execution::{
    EngineConfig, ExecuteRequest, ExecutionError, ExecutionOutcome, ExecutionStatus, Task,
    TaskExecution, TaskExecutionEngine, TaskStore, TaskType,
};
pub use keyspace::{KeyspaceError, KeyspaceStore, MemoryKeyspace, RedisKeyspace};
pub use locks::{Lease, LeaseSet, LockError, LockManager, ResourceType};
pub use platform::{AdapterRegistry, Platform, PlatformAdapter, PlatformError};
pub use queue::{EnqueueRequest, JobPriority, JobQueue, QueueConfig, QueueError, QueueStats, QueuedJob};
pub use rate_limit::{PolicyTable, RateLimitError, RateLimiter, RatePolicy};
pub use scheduler::{
    HandlerDeps, HandlerRegistry, Job, JobKind, JobStatus, JobStore, Scheduler, SchedulerConfig,
    SchedulerError,
};
pub use shutdown::{wait_for_shutdown_signal, ShutdownController};
