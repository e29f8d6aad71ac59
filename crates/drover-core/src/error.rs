//! Error types for drover-core
//!
//! Each component has its own error enum; [`Error`] wraps them for callers
//! that drive several components, and [`UserFriendlyError`] renders them
//! for the CLI.

use thiserror::Error;

use crate::audit::AuditError;
use crate::execution::ExecutionError;
use crate::keyspace::KeyspaceError;
use crate::locks::LockError;
use crate::platform::PlatformError;
use crate::queue::QueueError;
use crate::rate_limit::RateLimitError;
use crate::scheduler::SchedulerError;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Shared keyspace failure
    #[error("keyspace error: {0}")]
    Keyspace(#[from] KeyspaceError),

    /// Lease failure
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Rate limiter failure or exhausted quota
    #[error("rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// Queue failure
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Scheduler failure
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Task execution failure
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Audit trail failure
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// Platform collaborator failure
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Database failure outside any component
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration
    #[error("invalid configuration: {field}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for user-friendly error messages
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get a suggestion for how to fix the error
    fn suggestion(&self) -> Option<String>;
}

impl Error {
    /// Whether the same call may succeed later without any change
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Keyspace(e) => e.is_transient(),
            Error::Lock(e) => e.is_contention(),
            Error::RateLimit(RateLimitError::RateLimited { .. }) => true,
            Error::Queue(e) => e.is_transient(),
            Error::Scheduler(e) => e.is_contention(),
            Error::Execution(e) => e.is_retryable(),
            Error::Platform(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::Keyspace(e) => format!("Shared store unavailable: {}", e),
            Error::Lock(LockError::NotAcquired(resource)) => {
                format!("{} is busy with another job.", resource)
            }
            Error::Lock(e) => format!("Lock error: {}", e),
            Error::RateLimit(RateLimitError::RateLimited {
                platform,
                retry_after,
                ..
            }) => format!(
                "Rate limit reached on {}. Please wait {} seconds.",
                platform,
                retry_after.as_secs().max(1)
            ),
            Error::RateLimit(e) => format!("Rate limiter error: {}", e),
            Error::Queue(QueueError::DuplicateJob { dedupe_key, .. }) => {
                format!("A run for {} is already queued.", dedupe_key)
            }
            Error::Queue(e) => format!("Queue error: {}", e),
            Error::Scheduler(SchedulerError::JobNotFound(id)) => format!("Job {} not found.", id),
            Error::Scheduler(SchedulerError::InvalidCron { expr, reason }) => {
                format!("Invalid cron expression '{}': {}", expr, reason)
            }
            Error::Scheduler(e) => format!("Scheduler error: {}", e),
            Error::Execution(ExecutionError::DependencyNotMet { depends_on, .. }) => {
                format!("Task {} must be completed first.", depends_on)
            }
            Error::Execution(e) => format!("Task failed ({}): {}", e.code(), e),
            Error::Audit(e) => format!("Audit error: {}", e),
            Error::Platform(e) => format!("Platform error ({}): {}", e.code(), e),
            Error::Database(e) => format!("Database error: {}", e),
            Error::InvalidConfig { field, message } => {
                format!("Configuration error in '{}': {}", field, message)
            }
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::Keyspace(_) => {
                Some("Check that Redis is reachable at keyspace.url, or use the memory backend.".to_string())
            }
            Error::Lock(LockError::NotAcquired(_)) | Error::RateLimit(_) => {
                Some("The job will be retried automatically; no action is needed.".to_string())
            }
            Error::Queue(QueueError::DuplicateJob { .. }) => {
                Some("Wait for the queued run to finish before requesting another.".to_string())
            }
            Error::Scheduler(SchedulerError::InvalidCron { .. }) => Some(
                "Use five fields (minute hour day month weekday) or six with leading seconds."
                    .to_string(),
            ),
            Error::Execution(ExecutionError::DependencyNotMet { .. }) => {
                Some("Run the prerequisite task, or force the execution.".to_string())
            }
            Error::InvalidConfig { field, .. } => Some(format!(
                "Check the '{}' setting in config/default.toml or the DROVER_ environment.",
                field
            )),
            _ => None,
        }
    }
}

/// Format an error for display in the CLI
pub fn format_error_for_cli(error: &Error) -> String {
    let mut output = error.user_message();
    if let Some(suggestion) = error.suggestion() {
        output.push_str("\n\n");
        output.push_str(&suggestion);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_rate_limited_message() {
        let error = Error::from(RateLimitError::RateLimited {
            platform: Platform::Farcaster,
            account_id: "acct".to_string(),
            retry_after: Duration::from_secs(30),
        });

        assert!(error.user_message().contains("30 seconds"));
        assert!(error.user_message().contains("farcaster"));
        assert!(error.is_transient());
        assert!(error.suggestion().unwrap().contains("retried"));
    }

    #[test]
    fn test_dependency_message() {
        let depends_on = Uuid::new_v4();
        let error = Error::from(ExecutionError::DependencyNotMet {
            task_id: Uuid::new_v4(),
            depends_on,
        });

        assert!(error.user_message().contains(&depends_on.to_string()));
        assert!(!error.is_transient());
    }

    #[test]
    fn test_invalid_cron_message() {
        let error = Error::from(SchedulerError::InvalidCron {
            expr: "every minute".to_string(),
            reason: "bad".to_string(),
        });

        let output = format_error_for_cli(&error);
        assert!(output.contains("every minute"));
        assert!(output.contains("five fields"));
    }

    #[test]
    fn test_invalid_config_message() {
        let error = Error::InvalidConfig {
            field: "scheduler.workers".to_string(),
            message: "must be positive".to_string(),
        };

        assert!(error.user_message().contains("scheduler.workers"));
        assert!(error.suggestion().unwrap().contains("scheduler.workers"));
    }
}
