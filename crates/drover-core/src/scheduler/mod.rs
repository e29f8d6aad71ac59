//! Scheduler - cron jobs, a shared queue and a worker pool
//!
//! Jobs are stored in SQLite and triggered three ways: per-job cron timers,
//! the periodic due-job checker, and run-now requests (direct calls or
//! messages on `jobs:queue`). All three enqueue onto the same [`JobQueue`]
//! with the dedupe key `job:<id>`. Workers claim items, take the job lock
//! and dispatch to the [`JobHandler`] registered for the job's kind.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ cron timers  │  │ due checker  │  │ jobs:queue   │
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        └─────────────────┼─────────────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │    JobQueue     │  priority + retries + dedupe
//!                 └────────┬────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │  worker pool    │  job lock, run history, events
//!                 └────────┬────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ HandlerRegistry │  one handler per JobKind
//!                 └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use drover_core::scheduler::{Job, JobKind, JobStore, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(
//!     JobStore::new(db.pool().clone()),
//!     queue,
//!     locks,
//!     keyspace,
//!     HandlerRegistry::standard(deps),
//!     SchedulerConfig::new().with_workers(5),
//! );
//!
//! scheduler
//!     .create_job(Job::new(user_id, "sync", JobKind::BalanceSync).with_cron("*/10 * * * *"))
//!     .await?;
//!
//! scheduler.run(shutdown).await?;
//! ```

mod cron;
mod engine;
mod handlers;
mod store;
mod types;

#[cfg(test)]
mod tests;

pub use cron::CronSchedule;
pub use engine::{Scheduler, RUN_REQUEST_CHANNEL};
pub use handlers::{
    HandlerDeps, HandlerRegistry, JobContext, JobHandler, RunSummary, DEFAULT_MAX_ACTIONS,
    DEFAULT_MAX_PARALLEL,
};
pub use store::JobStore;
pub use types::{
    Job, JobKind, JobPayload, JobRun, JobRunStatus, JobStatus, Result as SchedulerResult,
    RunRequest, SchedulerConfig, SchedulerError,
};
