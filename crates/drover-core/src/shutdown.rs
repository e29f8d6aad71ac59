//! Graceful shutdown
//!
//! One [`ShutdownController`] owns the root cancellation token. Workers,
//! timers, the due-job checker and the run-request subscriber each hold a
//! child token, and every job run in flight holds a [`RunGuard`]. Shutdown
//! stops workers from claiming, cancels the tree, then waits for the guards
//! to drop, up to a timeout.
//!
//! ```ignore
//! let shutdown = ShutdownController::with_timeout(Duration::from_secs(30));
//! let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
//!
//! wait_for_shutdown_signal().await;
//! shutdown.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coordinates cancellation and the drain of in-flight job runs
pub struct ShutdownController {
    cancel_token: CancellationToken,
    accepting: AtomicBool,
    in_flight: AtomicU32,
    idle: Notify,
    timeout: Duration,
}

impl ShutdownController {
    /// Controller that waits up to `timeout` for in-flight runs
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancel_token: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
            idle: Notify::new(),
            timeout,
        })
    }

    /// Child token for one component
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Whether workers may still claim queue items
    #[must_use]
    pub fn is_accepting_work(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Count a job run as in flight until the guard drops
    pub fn track_run(self: &Arc<Self>) -> RunGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RunGuard {
            controller: Arc::clone(self),
        }
    }

    /// Job runs still in flight
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop claiming, cancel everything and wait for in-flight runs
    ///
    /// Returns whether every run finished within the timeout. Only the first
    /// call drains; later calls return immediately with the current state.
    pub async fn shutdown(&self) -> bool {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            debug!("Shutdown already initiated");
            return self.in_flight() == 0;
        }

        info!(in_flight = self.in_flight(), "Initiating graceful shutdown");
        self.cancel_token.cancel();

        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(self.timeout, drained).await.is_ok() {
            info!("All job runs drained");
            true
        } else {
            warn!(
                in_flight = self.in_flight(),
                timeout_secs = self.timeout.as_secs(),
                "Shutdown timeout exceeded, abandoning in-flight runs"
            );
            false
        }
    }
}

/// Marks one job run in flight
pub struct RunGuard {
    controller: Arc<ShutdownController>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.controller.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.controller.idle.notify_waiters();
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_claiming_and_cancels_children() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(1));
        let token = controller.token();
        assert!(controller.is_accepting_work());

        assert!(controller.shutdown().await);

        assert!(!controller.is_accepting_work());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_run_in_flight() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(5));
        let guard = controller.track_run();
        let token = controller.token();
        let run = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.shutdown().await);
        assert_eq!(controller.in_flight(), 0);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_run() {
        let controller = ShutdownController::with_timeout(Duration::from_millis(100));
        let _stuck = controller.track_run();

        assert!(!controller.shutdown().await);
        assert_eq!(controller.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_second_shutdown_does_not_drain_again() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(1));
        let (first, second) = tokio::join!(controller.shutdown(), controller.shutdown());
        assert!(first && second);
    }
}
