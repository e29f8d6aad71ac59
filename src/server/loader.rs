//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use super::config::{AppConfig, KeyspaceBackend};
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let config = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                std::env::var("DROVER_ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        .add_source(File::with_name("config/local").required(false))
        // 3. Environment variables (highest priority)
        // DROVER_QUEUE__MAX_RETRIES, not DROVER__QUEUE__MAX_RETRIES
        .add_source(
            Environment::with_prefix("DROVER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings the components would silently clamp or misbehave on
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.keyspace.backend == KeyspaceBackend::Redis && config.keyspace.url.is_empty() {
        bail!("keyspace.url is required when keyspace.backend = \"redis\"");
    }
    if config.scheduler.workers == 0 {
        bail!("scheduler.workers must be at least 1");
    }
    if config.queue.lease_secs == 0 {
        bail!("queue.lease_secs must be positive");
    }
    if config.engine.lock_ttl_secs == 0 {
        bail!("engine.lock_ttl_secs must be positive");
    }
    if config.engine.max_concurrent_per_user == 0 {
        bail!("engine.max_concurrent_per_user must be at least 1");
    }
    if config.audit.batch_size == 0 || config.audit.buffer_capacity == 0 {
        bail!("audit.batch_size and audit.buffer_capacity must be positive");
    }
    for limit in &config.rate_limits {
        if limit.window_secs == 0 {
            bail!("rate_limits: window_secs for {} must be positive", limit.platform);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AppConfig {
        Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_embedded_defaults_are_valid() {
        let config = defaults();
        assert!(validate(&config).is_ok());
        assert_eq!(config.keyspace.backend, KeyspaceBackend::Memory);
        assert_eq!(config.scheduler.workers, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.engine.max_concurrent_per_user, 10);
    }

    #[test]
    fn test_redis_requires_url() {
        let mut config = defaults();
        config.keyspace.backend = KeyspaceBackend::Redis;
        config.keyspace.url = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = defaults();
        config.scheduler.workers = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("scheduler.workers"));
    }
}
