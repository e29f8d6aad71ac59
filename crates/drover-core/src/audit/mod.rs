//! Durable, idempotent audit trail
//!
//! Every side-effecting action is recorded once. Ordinary entries go through
//! a bounded buffer drained by a background flusher, which inserts up to
//! `batch_size` entries per transaction or flushes on a fixed interval. When
//! the buffer is full the caller writes directly, so nothing is dropped.
//! A batch the store rejects is retried a few times, then written row by
//! row; rows that still fail stay buffered for the next flush.
//!
//! Entries carrying an idempotency key always take the synchronous path: the
//! key column is unique, and a collision must be reported to the caller as
//! [`AuditError::DuplicateIdempotencyKey`] instead of being lost in a batch.

mod store;
mod types;


pub use store::AuditStore;
pub use types::{
    AuditAction, AuditConfig, AuditEntry, AuditError, AuditFilter, AuditResult, Finalization,
    Result, UserActivity,
};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::platform::Platform;
use crate::utils::{retry_with_backoff, RetryConfig};

/// Default page size for [`AuditLogger::query`]
pub const DEFAULT_QUERY_LIMIT: i64 = 50;
/// Largest page [`AuditLogger::query`] returns
pub const MAX_QUERY_LIMIT: i64 = 1000;

enum Command {
    Entry(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Buffered audit logger
#[derive(Clone)]
pub struct AuditLogger {
    store: AuditStore,
    tx: mpsc::Sender<Command>,
    config: AuditConfig,
    cancel: CancellationToken,
    flusher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuditLogger {
    /// Start a logger and its background flusher
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(store: AuditStore, config: AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(
            store.clone(),
            rx,
            config.batch_size,
            config.flush_interval,
            cancel.clone(),
        ));

        Self {
            store,
            tx,
            config,
            cancel,
            flusher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Record an entry, buffered when possible
    pub async fn log(&self, entry: AuditEntry) -> Result<AuditEntry> {
        if entry.idempotency_key.is_some() {
            return self.log_sync(entry).await;
        }

        match self.tx.try_send(Command::Entry(entry.clone())) {
            Ok(()) => Ok(entry),
            Err(e) => {
                if matches!(e, mpsc::error::TrySendError::Full(_)) {
                    debug!(entry_id = %entry.id, "Audit buffer full, writing directly");
                }
                self.store.insert(&entry).await?;
                Ok(entry)
            }
        }
    }

    /// Record an entry durably before returning
    pub async fn log_sync(&self, entry: AuditEntry) -> Result<AuditEntry> {
        self.store.insert(&entry).await?;
        Ok(entry)
    }

    /// Record a successful action
    pub async fn log_success(
        &self,
        user_id: Uuid,
        action: AuditAction,
        platform: Option<Platform>,
    ) -> Result<AuditEntry> {
        let mut entry = AuditEntry::new(user_id, action, AuditResult::Success);
        entry.platform = platform;
        self.log(entry).await
    }

    /// Record a failed action
    pub async fn log_failure(
        &self,
        user_id: Uuid,
        action: AuditAction,
        platform: Option<Platform>,
        error: &str,
    ) -> Result<AuditEntry> {
        let mut entry = AuditEntry::new(user_id, action, AuditResult::Failed).with_error(error);
        entry.platform = platform;
        self.log(entry).await
    }

    /// Upgrade a pending entry to its terminal result, once
    pub async fn finalize(&self, id: Uuid, outcome: Finalization) -> Result<AuditEntry> {
        self.store.finalize(id, &outcome).await
    }

    /// Get an entry
    pub async fn get(&self, id: Uuid) -> Result<AuditEntry> {
        self.store.get(id).await
    }

    /// Get the entry recorded under an idempotency key
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<AuditEntry>> {
        self.store.find_by_idempotency_key(key).await
    }

    /// Results of earlier attempts recorded under `<base>:<n>` keys
    pub async fn attempt_results(&self, base: &str) -> Result<Vec<AuditResult>> {
        self.store.attempt_results(base).await
    }

    /// Filtered page of entries, newest first, plus the unpaged total
    ///
    /// `limit` defaults to 50 and is capped at 1000.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<(Vec<AuditEntry>, u64)> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT);
        self.store.query(filter, limit, offset.max(0)).await
    }

    /// Per-action and per-result counts for a user since `since`
    pub async fn user_activity(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<UserActivity> {
        self.store.user_activity(user_id, since).await
    }

    /// Delete entries older than `retention_days`
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let deleted = self.store.delete_before(cutoff).await?;
        info!(retention_days, deleted, "Audit log cleanup finished");
        Ok(deleted)
    }

    /// Configured retention
    #[must_use]
    pub fn retention_days(&self) -> u32 {
        self.config.retention_days
    }

    /// Write out everything buffered so far
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain the buffer and stop the flusher
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.flusher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Audit flusher panicked");
            }
        }
    }
}

async fn run_flusher(
    store: AuditStore,
    mut rx: mpsc::Receiver<Command>,
    batch_size: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut batch: Vec<AuditEntry> = Vec::with_capacity(batch_size);
    // Entries left over from failed flushes, kept at the front of `batch`
    let mut carried = 0usize;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Entry(entry)) => {
                    batch.push(entry);
                    if batch.len() >= carried + batch_size {
                        carried = flush_batch(&store, &mut batch).await;
                    }
                }
                Some(Command::Flush(done)) => {
                    carried = flush_batch(&store, &mut batch).await;
                    let _ = done.send(());
                }
                None => break,
            },
            _ = ticker.tick() => carried = flush_batch(&store, &mut batch).await,
            _ = cancel.cancelled() => {
                rx.close();
                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        Command::Entry(entry) => batch.push(entry),
                        Command::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                break;
            }
        }
    }

    let lost = flush_batch(&store, &mut batch).await;
    if lost > 0 {
        error!(count = lost, "Audit flusher stopped with unwritten entries");
    }
    debug!("Audit flusher stopped");
}

fn flush_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_millis(500))
}

fn is_transient(err: &AuditError) -> bool {
    !matches!(err, AuditError::DuplicateIdempotencyKey(_))
}

/// Write `batch`, leaving in it only the entries that could not be written
///
/// Returns how many entries remain for the next flush.
async fn flush_batch(store: &AuditStore, batch: &mut Vec<AuditEntry>) -> usize {
    if batch.is_empty() {
        return 0;
    }

    let retry = flush_retry();
    let entries: &[AuditEntry] = batch;
    let written = retry_with_backoff(&retry, || store.insert_batch(entries), is_transient).await;
    let err = match written {
        Ok(()) => {
            debug!(count = batch.len(), "Audit batch written");
            batch.clear();
            return 0;
        }
        Err(e) => e,
    };

    warn!(count = batch.len(), error = %err, "Audit batch failed, writing row by row");
    let mut kept = Vec::new();
    for entry in batch.drain(..) {
        match store.insert(&entry).await {
            Ok(()) => {}
            Err(AuditError::DuplicateIdempotencyKey(key)) => {
                warn!(entry_id = %entry.id, idempotency_key = %key, "Duplicate audit entry rejected");
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Audit entry kept for next flush");
                kept.push(entry);
            }
        }
    }
    *batch = kept;
    batch.len()
}
