//! Scheduler engine and worker pool
//!
//! `Scheduler::run` owns four kinds of tasks:
//!
//! - one timer per cron job, enqueueing the job at each fire time
//! - `workers` workers pulling from the shared [`JobQueue`]
//! - the due-job checker, which also recovers expired queue leases
//! - a subscriber turning `jobs:queue` messages into run-now requests
//!
//! Every enqueue carries the dedupe key `job:<id>`, so timers, the checker
//! and run-now requests never stack more than one outstanding run per job.

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cron::CronSchedule;
use super::handlers::{HandlerRegistry, JobContext};
use super::store::JobStore;
use super::types::{
    Job, JobPayload, JobRun, JobRunStatus, JobStatus, Result, RunRequest, SchedulerConfig,
    SchedulerError,
};
use crate::event_bus::{EngineEvent, EventBus};
use crate::keyspace::KeyspaceStore;
use crate::locks::{Lease, LockManager, ResourceType};
use crate::queue::{EnqueueRequest, FailOutcome, JobPriority, JobQueue, QueueError, QueuedJob};
use crate::shutdown::ShutdownController;

/// Pub/sub channel for cross-process run requests
pub const RUN_REQUEST_CHANNEL: &str = "jobs:queue";

/// How a worker left a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Completed,
    Retrying,
    Failed,
    Deferred,
    Abandoned,
}

/// Job scheduler with a worker pool
#[derive(Clone)]
pub struct Scheduler {
    store: JobStore,
    queue: JobQueue,
    locks: LockManager,
    keyspace: Arc<dyn KeyspaceStore>,
    handlers: HandlerRegistry,
    events: EventBus,
    config: SchedulerConfig,
    timers: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(
        store: JobStore,
        queue: JobQueue,
        locks: LockManager,
        keyspace: Arc<dyn KeyspaceStore>,
        handlers: HandlerRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            keyspace,
            handlers,
            events: EventBus::default(),
            config,
            timers: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish job events on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Job store
    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Shared queue
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run until shutdown
    ///
    /// Returns after every worker has finished its current job or the
    /// shutdown controller gave up waiting.
    pub async fn run(&self, shutdown: Arc<ShutdownController>) -> Result<()> {
        info!(
            workers = self.config.workers,
            queue = self.queue.name(),
            "Scheduler starting"
        );
        self.running.store(true, Ordering::SeqCst);

        let cron_jobs = self.store.list_active_cron_jobs().await?;
        let mut scheduled = 0usize;
        for job in &cron_jobs {
            match self.schedule_job(job).await {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "Job not scheduled"),
            }
        }
        info!(jobs = scheduled, "Cron timers started");

        let mut tasks = JoinSet::new();
        for n in 0..self.config.workers {
            let worker = self.clone();
            let worker_id = format!("worker-{}-{}", n, Uuid::new_v4().simple());
            let shutdown = Arc::clone(&shutdown);
            let token = self.cancel.child_token();
            tasks.spawn(async move { worker.worker_loop(worker_id, shutdown, token).await });
        }
        {
            let subscriber = self.clone();
            let token = self.cancel.child_token();
            tasks.spawn(async move { subscriber.subscriber_loop(token).await });
        }

        let stop = shutdown.token();
        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_due().await {
                        error!(error = %e, "Due-job check failed");
                    }
                }
                _ = stop.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.timers.lock().await.clear();
        while tasks.join_next().await.is_some() {}

        info!("Scheduler stopped");
        Ok(())
    }

    /// Whether `run` is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate and store a new job, starting its timer when running
    pub async fn create_job(&self, mut job: Job) -> Result<Job> {
        if let Some(expr) = &job.cron_expr {
            let schedule = CronSchedule::parse(expr)?;
            if job.next_run_at.is_none() {
                job.next_run_at = schedule.next_after(Utc::now());
            }
        }
        self.store.save_job(&job).await?;
        info!(job_id = %job.id, kind = %job.kind, "Job created");

        if self.is_running() && job.cron_expr.is_some() {
            self.schedule_job(&job).await?;
        }
        Ok(job)
    }

    /// Get a live job
    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store.get_job(id).await
    }

    /// Live jobs, optionally for one user
    pub async fn list_jobs(&self, user_id: Option<Uuid>) -> Result<Vec<Job>> {
        self.store.list_jobs(user_id).await
    }

    /// Run history of a job, newest first
    pub async fn job_runs(&self, id: Uuid, limit: i64) -> Result<Vec<JobRun>> {
        self.store.runs_for_job(id, limit).await
    }

    /// Stop automatic triggering
    pub async fn pause_job(&self, id: Uuid) -> Result<()> {
        self.store.set_status(id, JobStatus::Paused).await?;
        self.unschedule_job(id).await;
        info!(job_id = %id, "Job paused");
        Ok(())
    }

    /// Resume automatic triggering
    pub async fn resume_job(&self, id: Uuid) -> Result<()> {
        self.store.set_status(id, JobStatus::Idle).await?;
        let job = self.store.get_job(id).await?;
        if self.is_running() && job.cron_expr.is_some() {
            self.schedule_job(&job).await?;
        }
        info!(job_id = %id, "Job resumed");
        Ok(())
    }

    /// Soft-delete a job and stop its timer
    pub async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.store.soft_delete(id).await?;
        self.unschedule_job(id).await;
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Start or replace the cron timer of a job
    pub async fn schedule_job(&self, job: &Job) -> Result<()> {
        let expr = job
            .cron_expr
            .as_deref()
            .ok_or_else(|| SchedulerError::InvalidConfig(format!("job {} has no cron expression", job.id)))?;
        let schedule = CronSchedule::parse(expr)?;
        self.store
            .set_next_run(job.id, schedule.next_after(Utc::now()))
            .await?;

        let token = self.cancel.child_token();
        if let Some(previous) = self.timers.lock().await.insert(job.id, token.clone()) {
            previous.cancel();
        }

        let scheduler = self.clone();
        let job_id = job.id;
        tokio::spawn(async move { scheduler.timer_loop(job_id, schedule, token).await });
        debug!(job_id = %job.id, cron = expr, "Timer scheduled");
        Ok(())
    }

    /// Stop the cron timer of a job, if any
    pub async fn unschedule_job(&self, id: Uuid) {
        if let Some(token) = self.timers.lock().await.remove(&id) {
            token.cancel();
            debug!(job_id = %id, "Timer removed");
        }
    }

    /// Jobs with a live timer
    pub async fn scheduled_jobs(&self) -> Vec<Uuid> {
        self.timers.lock().await.keys().copied().collect()
    }

    /// Enqueue a job immediately
    ///
    /// Fails with [`QueueError::DuplicateJob`] while a previous run of the
    /// same job is still outstanding.
    pub async fn run_now(&self, job_id: Uuid) -> Result<QueuedJob> {
        let job = self.store.get_job(job_id).await?;
        let queued = self.enqueue_job(&job, JobPriority::High).await?;
        info!(job_id = %job.id, queued_job_id = %queued.id, "Job run requested");
        Ok(queued)
    }

    /// Ask whichever process is subscribed to run a job now
    pub async fn publish_run_request(&self, job_id: Uuid, user_id: Option<Uuid>) -> Result<()> {
        let payload = serde_json::to_string(&RunRequest { job_id, user_id })?;
        self.keyspace.publish(RUN_REQUEST_CHANNEL, &payload).await?;
        debug!(job_id = %job_id, "Run request published");
        Ok(())
    }

    /// Enqueue due jobs and recover lapsed queue leases, once
    ///
    /// Returns the number of jobs enqueued.
    pub async fn check_due(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.store.list_due_jobs(now).await?;
        let mut enqueued = 0usize;

        for job in due {
            match self.enqueue_job(&job, JobPriority::Normal).await {
                Ok(_) => enqueued += 1,
                Err(SchedulerError::Queue(QueueError::DuplicateJob { .. })) => {
                    debug!(job_id = %job.id, "Due job already queued");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to enqueue due job");
                    continue;
                }
            }
            let next = job
                .cron_expr
                .as_deref()
                .and_then(|expr| CronSchedule::parse(expr).ok())
                .and_then(|s| s.next_after(now));
            self.store.set_next_run(job.id, next).await?;
        }

        let recovered = self.queue.recover_expired().await?;
        if enqueued > 0 || recovered > 0 {
            info!(enqueued, recovered, "Due-job check");
        }
        Ok(enqueued)
    }

    async fn enqueue_job(&self, job: &Job, priority: JobPriority) -> Result<QueuedJob> {
        let payload = serde_json::to_value(JobPayload {
            job_id: job.id,
            user_id: job.user_id,
        })?;
        let request = EnqueueRequest::new(job.kind.as_str(), payload)
            .with_priority(priority)
            .with_dedupe_key(job.dedupe_key());
        Ok(self.queue.enqueue(request).await?)
    }

    async fn timer_loop(self, job_id: Uuid, schedule: CronSchedule, token: CancellationToken) {
        loop {
            let Some(next) = schedule.next_after(Utc::now()) else {
                debug!(job_id = %job_id, "Schedule has no further fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = token.cancelled() => break,
            }

            let job = match self.store.get_job(job_id).await {
                Ok(job) => job,
                Err(SchedulerError::JobNotFound(_)) => {
                    debug!(job_id = %job_id, "Timer stopped for deleted job");
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Timer could not load job");
                    continue;
                }
            };
            if !job.is_schedulable() {
                debug!(job_id = %job_id, status = job.status.as_str(), "Timer fired for unschedulable job");
                continue;
            }

            match self.enqueue_job(&job, JobPriority::Normal).await {
                Ok(queued) => debug!(job_id = %job_id, queued_job_id = %queued.id, "Timer enqueued job"),
                Err(SchedulerError::Queue(QueueError::DuplicateJob { .. })) => {
                    debug!(job_id = %job_id, "Previous run still outstanding");
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "Timer failed to enqueue job"),
            }
            if let Err(e) = self
                .store
                .set_next_run(job_id, schedule.next_after(Utc::now()))
                .await
            {
                warn!(job_id = %job_id, error = %e, "Failed to store next run");
            }
        }
    }

    async fn subscriber_loop(self, token: CancellationToken) {
        let mut messages = match self.keyspace.subscribe(RUN_REQUEST_CHANNEL).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, channel = RUN_REQUEST_CHANNEL, "Subscription failed");
                return;
            }
        };

        loop {
            let message = tokio::select! {
                message = messages.next() => message,
                _ = token.cancelled() => break,
            };
            let Some(raw) = message else {
                warn!(channel = RUN_REQUEST_CHANNEL, "Subscription closed");
                break;
            };
            if let Err(e) = self.handle_run_request(&raw).await {
                match e {
                    SchedulerError::Queue(QueueError::DuplicateJob { .. }) => {
                        debug!(payload = %raw, "Run request for already queued job")
                    }
                    e => warn!(payload = %raw, error = %e, "Run request rejected"),
                }
            }
        }
    }

    async fn handle_run_request(&self, raw: &str) -> Result<()> {
        let request: RunRequest = serde_json::from_str(raw)?;
        if let Some(user_id) = request.user_id {
            let job = self.store.get_job(request.job_id).await?;
            if job.user_id != user_id {
                return Err(SchedulerError::JobNotFound(request.job_id));
            }
        }
        self.run_now(request.job_id).await?;
        Ok(())
    }

    async fn worker_loop(
        self,
        worker_id: String,
        shutdown: Arc<ShutdownController>,
        token: CancellationToken,
    ) {
        debug!(worker = %worker_id, "Worker started");
        loop {
            if token.is_cancelled() || !shutdown.is_accepting_work() {
                break;
            }

            match self.queue.dequeue(&worker_id, self.config.lease).await {
                Ok(Some(item)) => {
                    let _run = shutdown.track_run();
                    self.process(&worker_id, item, &token).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker = %worker_id, error = %e, "Dequeue failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = token.cancelled() => break,
            }
        }
        debug!(worker = %worker_id, "Worker stopped");
    }

    /// Run one queue item to its disposition
    async fn process(&self, worker_id: &str, item: QueuedJob, token: &CancellationToken) {
        let payload: JobPayload = match serde_json::from_value(item.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(queued_job_id = %item.id, error = %e, "Unreadable job payload");
                if let Err(e) = self.queue.fail(item.id, worker_id, &format!("invalid payload: {}", e)).await {
                    warn!(queued_job_id = %item.id, error = %e, "Failed to fail queue item");
                }
                return;
            }
        };

        let lease = match self
            .locks
            .acquire(ResourceType::Job, &payload.job_id.to_string(), self.config.lease)
            .await
        {
            Ok(lease) => lease,
            Err(e) if e.is_contention() => {
                debug!(job_id = %payload.job_id, "Job locked elsewhere, rescheduling");
                self.defer(worker_id, item.id).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %payload.job_id, error = %e, "Job lock failed");
                self.defer(worker_id, item.id).await;
                return;
            }
        };

        let disposition = self.run_locked(worker_id, &item, &payload, lease.clone(), token).await;
        if let Err(e) = self.locks.release(&lease).await {
            warn!(job_id = %payload.job_id, error = %e, "Job lock release failed");
        }
        debug!(worker = %worker_id, job_id = %payload.job_id, disposition = ?disposition, "Queue item settled");
    }

    async fn defer(&self, worker_id: &str, id: Uuid) {
        if let Err(e) = self.queue.reschedule(id, worker_id, self.config.contention_delay).await {
            warn!(queued_job_id = %id, error = %e, "Reschedule failed");
        }
    }

    async fn run_locked(
        &self,
        worker_id: &str,
        item: &QueuedJob,
        payload: &JobPayload,
        mut lease: Lease,
        token: &CancellationToken,
    ) -> Disposition {
        let job = match self.store.get_job(payload.job_id).await {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound(id)) => {
                info!(job_id = %id, "Job deleted before it ran");
                if let Err(e) = self
                    .queue
                    .complete(item.id, worker_id, Some(json!({ "skipped": "job deleted" })))
                    .await
                {
                    warn!(queued_job_id = %item.id, error = %e, "Queue complete failed");
                }
                return Disposition::Completed;
            }
            Err(e) => {
                warn!(job_id = %payload.job_id, error = %e, "Job load failed");
                self.defer(worker_id, item.id).await;
                return Disposition::Deferred;
            }
        };

        let started_at = Utc::now();
        let started = Instant::now();
        let run = match self.begin_run(&job, item.id, started_at).await {
            Ok(run) => run,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to record run start");
                self.defer(worker_id, item.id).await;
                return Disposition::Deferred;
            }
        };
        self.events.publish(EngineEvent::JobStarted {
            job_id: job.id,
            user_id: job.user_id,
            queued_job_id: item.id,
            run_id: run.id,
        });
        info!(job_id = %job.id, kind = %job.kind, worker = %worker_id, "Job started");

        let result = self.execute(worker_id, item, &job, &mut lease, token).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let disposition = self.settle(worker_id, &job, item, &run, &result).await;
        self.events.publish(EngineEvent::JobCompleted {
            job_id: job.id,
            user_id: job.user_id,
            success: result.is_ok(),
            duration_ms,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        match &result {
            Ok(_) => info!(job_id = %job.id, duration_ms, "Job completed"),
            Err(e) => warn!(job_id = %job.id, duration_ms, error = %e, disposition = ?disposition, "Job run failed"),
        }
        disposition
    }

    async fn begin_run(&self, job: &Job, queued_job_id: Uuid, at: chrono::DateTime<Utc>) -> Result<JobRun> {
        self.store.mark_running(job.id, at).await?;
        self.store.record_run_start(job.id, Some(queued_job_id)).await
    }

    /// Run the handler under the job timeout, heartbeating the queue and job leases
    async fn execute(
        &self,
        worker_id: &str,
        item: &QueuedJob,
        job: &Job,
        lease: &mut Lease,
        token: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let handler = self.handlers.get(job.kind)?;
        let ctx = JobContext {
            job: job.clone(),
            queued_job_id: item.id,
            cancel: token.child_token(),
        };

        let work = handler.handle(&ctx);
        tokio::pin!(work);
        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);
        let mut heartbeat =
            tokio::time::interval((self.config.lease / 3).max(Duration::from_millis(10)));
        heartbeat.tick().await;
        let mut lost = false;

        loop {
            tokio::select! {
                result = &mut work => {
                    return if lost { Err(SchedulerError::LeaseLost(item.id)) } else { result };
                }
                _ = &mut deadline => {
                    ctx.cancel.cancel();
                    return Err(SchedulerError::Timeout(self.config.job_timeout));
                }
                _ = heartbeat.tick(), if !lost => {
                    if !self.keep_leases(worker_id, item, job, lease).await {
                        // Let the handler wind down at its next cancellation check
                        ctx.cancel.cancel();
                        lost = true;
                    }
                }
            }
        }
    }

    /// Extend the queue item and job leases; `false` once either changed hands
    async fn keep_leases(&self, worker_id: &str, item: &QueuedJob, job: &Job, lease: &mut Lease) -> bool {
        match self.queue.heartbeat(item.id, worker_id, self.config.lease).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(queued_job_id = %item.id, error = %e, "Queue heartbeat failed");
            }
            Err(e) => {
                error!(queued_job_id = %item.id, worker = %worker_id, error = %e, "Queue lease lost, stopping job");
                return false;
            }
        }
        match self.locks.extend(lease, self.config.lease).await {
            Ok(()) => true,
            Err(e) if e.is_contention() => {
                error!(job_id = %job.id, worker = %worker_id, error = %e, "Job lock lost, stopping job");
                false
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job lock extend failed");
                true
            }
        }
    }

    /// Record the run outcome and move the queue item
    async fn settle(
        &self,
        worker_id: &str,
        job: &Job,
        item: &QueuedJob,
        run: &JobRun,
        result: &Result<serde_json::Value>,
    ) -> Disposition {
        // One-shot jobs keep a run time that is still ahead of a manual run
        let now = Utc::now();
        let next_run = match job.cron_expr.as_deref() {
            Some(expr) => CronSchedule::parse(expr).ok().and_then(|s| s.next_after(now)),
            None => job.next_run_at.filter(|at| *at > now),
        };

        let (run_status, disposition) = match result {
            Ok(summary) => {
                if let Err(e) = self.queue.complete(item.id, worker_id, Some(summary.clone())).await {
                    warn!(queued_job_id = %item.id, error = %e, "Queue complete failed");
                }
                (JobRunStatus::Success, Disposition::Completed)
            }
            Err(SchedulerError::Cancelled) => {
                if let Err(e) = self.queue.reschedule(item.id, worker_id, Duration::ZERO).await {
                    warn!(queued_job_id = %item.id, error = %e, "Requeue after cancel failed");
                }
                (JobRunStatus::Failed, Disposition::Deferred)
            }
            Err(SchedulerError::LeaseLost(_)) => (JobRunStatus::Failed, Disposition::Abandoned),
            Err(e) if e.is_contention() => {
                self.defer(worker_id, item.id).await;
                (JobRunStatus::Failed, Disposition::Deferred)
            }
            Err(e) => {
                let status = if matches!(e, SchedulerError::Timeout(_)) {
                    JobRunStatus::Timeout
                } else {
                    JobRunStatus::Failed
                };
                match self.queue.fail(item.id, worker_id, &e.to_string()).await {
                    Ok(FailOutcome::Retrying { .. }) => (status, Disposition::Retrying),
                    Ok(FailOutcome::Failed { .. }) => (status, Disposition::Failed),
                    Err(qe) => {
                        warn!(queued_job_id = %item.id, error = %qe, "Queue fail failed");
                        (status, Disposition::Retrying)
                    }
                }
            }
        };

        let message = match result {
            Ok(summary) => Some(summary.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Err(e) = self
            .store
            .finish_run(run.id, run_status, message.as_deref())
            .await
        {
            warn!(run_id = %run.id, error = %e, "Failed to close run");
        }

        // A manual run of a paused job leaves it paused
        let paused = job.status == JobStatus::Paused;
        let rest = if paused { JobStatus::Paused } else { JobStatus::Idle };
        let stored = match disposition {
            Disposition::Completed => {
                self.store.record_outcome(job.id, true, rest, next_run).await
            }
            Disposition::Retrying => {
                self.store.record_outcome(job.id, false, rest, next_run).await
            }
            Disposition::Failed => {
                let status = if paused { JobStatus::Paused } else { JobStatus::Failed };
                self.store.record_outcome(job.id, false, status, next_run).await
            }
            Disposition::Deferred => self.store.set_status(job.id, rest).await,
            // The item belongs to another worker now; its run owns the job row
            Disposition::Abandoned => Ok(()),
        };
        if let Err(e) = stored {
            warn!(job_id = %job.id, error = %e, "Failed to update job counters");
        }
        disposition
    }
}
