//! Server configuration types
//!
//! Mirrors `config/default.toml`. Each section converts into the builder
//! config of the component it drives.

use drover_core::audit::AuditConfig;
use drover_core::execution::EngineConfig;
use drover_core::platform::Platform;
use drover_core::queue::QueueConfig;
use drover_core::rate_limit::{PolicyTable, RatePolicy};
use drover_core::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub keyspace: KeyspaceSettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub scheduler: SchedulerSettings,
    pub engine: EngineSettings,
    pub audit: AuditSettings,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitOverride>,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Which keyspace backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyspaceBackend {
    Memory,
    Redis,
}

/// Shared keyspace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyspaceSettings {
    pub backend: KeyspaceBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// SQLite settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

/// Job queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    pub lease_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
}

impl QueueSettings {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.name.clone())
            .with_default_max_retries(self.max_retries)
            .with_backoff(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_cap_secs),
            )
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub check_interval_secs: u64,
    pub job_timeout_secs: u64,
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self, lease: Duration) -> SchedulerConfig {
        SchedulerConfig::new()
            .with_workers(self.workers)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_check_interval(Duration::from_secs(self.check_interval_secs))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs))
            .with_lease(lease)
    }
}

/// Task execution engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub lock_ttl_secs: u64,
    pub lock_max_wait_secs: u64,
    pub retry_base_ms: u64,
    pub retry_cap_secs: u64,
    pub max_concurrent_per_user: usize,
    pub bulk_max_parallel: usize,
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_locks(
                Duration::from_secs(self.lock_ttl_secs),
                Duration::from_secs(self.lock_max_wait_secs),
            )
            .with_retry_backoff(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_secs(self.retry_cap_secs),
            )
            .with_max_concurrent_per_user(self.max_concurrent_per_user)
    }
}

/// Audit trail settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub buffer_capacity: usize,
    pub retention_days: u32,
}

impl AuditSettings {
    pub fn to_audit_config(&self) -> AuditConfig {
        let mut config = AuditConfig::default()
            .with_batch_size(self.batch_size)
            .with_flush_interval(Duration::from_secs(self.flush_interval_secs))
            .with_buffer_capacity(self.buffer_capacity);
        config.retention_days = self.retention_days;
        config
    }
}

/// Per-platform rate limit override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub platform: Platform,
    pub window_secs: u64,
    pub max_tokens: u64,
    #[serde(default)]
    pub burst: u64,
}

/// Default policies with the configured overrides applied
pub fn policy_table(overrides: &[RateLimitOverride]) -> PolicyTable {
    overrides
        .iter()
        .fold(PolicyTable::default(), |table, o| {
            table.with_policy(
                o.platform,
                RatePolicy::new(Duration::from_secs(o.window_secs), o.max_tokens, o.burst),
            )
        })
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_overrides_replace_defaults() {
        let table = policy_table(&[RateLimitOverride {
            platform: Platform::Twitter,
            window_secs: 60,
            max_tokens: 3,
            burst: 1,
        }]);

        let twitter = table.get(Platform::Twitter);
        assert_eq!(twitter.window, Duration::from_secs(60));
        assert_eq!(twitter.max_tokens, 3);
        assert_eq!(table.get(Platform::Farcaster), PolicyTable::default().get(Platform::Farcaster));
    }
}
