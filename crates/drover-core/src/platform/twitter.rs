use super::{Platform, PlatformAdapter, PlatformError, PlatformResult, RateLimitStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Twitter / X adapter skeleton
///
/// Only quota reporting is wired; every social capability falls through to
/// the trait's `NotImplemented` defaults until API access is provisioned.
#[derive(Debug, Clone, Default)]
pub struct TwitterAdapter;

impl TwitterAdapter {
    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn authenticate(&self, _account_id: Uuid) -> PlatformResult<()> {
        Err(PlatformError::NotImplemented(
            "twitter authentication requires API v2 credentials".into(),
        ))
    }

    async fn rate_limit_status(&self, _account_id: Uuid) -> PlatformResult<RateLimitStatus> {
        // Free-tier write quota per 15 minute window
        Ok(RateLimitStatus {
            remaining: 15,
            limit: 15,
            reset_at: None,
        })
    }
}
