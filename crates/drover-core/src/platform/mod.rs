//! External capabilities the engine drives
//!
//! The engine never speaks a platform's wire protocol. It depends only on the
//! capability traits declared here:
//!
//! - [`PlatformAdapter`]: social actions, one implementation per platform
//! - [`WalletSigner`] / [`WalletService`]: transaction preparation and balances
//! - [`BrowserSessionProvider`]: interactive automation sessions
//! - [`ContentGenerator`]: text generation for content jobs
//!
//! Every `PlatformAdapter` capability defaults to [`PlatformError::NotImplemented`],
//! so partial clients only override what their platform supports.

mod browser;
mod content;
mod registry;
mod twitter;
mod wallet;

pub use browser::{BrowserAction, BrowserActionResult, BrowserSession, BrowserSessionProvider};
pub use content::{ContentGenerator, ContentRequest, GeneratedContent};
pub use registry::AdapterRegistry;
pub use twitter::TwitterAdapter;
pub use wallet::{PreparedTransaction, TransactionIntent, WalletBalance, WalletService, WalletSigner};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::execution::Proof;

/// Supported platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Farcaster
    Farcaster,
    /// Telegram
    Telegram,
    /// Twitter / X
    Twitter,
    /// Discord
    Discord,
    /// On-chain actions, no social platform involved
    Onchain,
}

impl Platform {
    /// Lowercase identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Farcaster => "farcaster",
            Self::Telegram => "telegram",
            Self::Twitter => "twitter",
            Self::Discord => "discord",
            Self::Onchain => "onchain",
        }
    }

    /// All platforms
    pub const ALL: [Platform; 5] = [
        Self::Farcaster,
        Self::Telegram,
        Self::Twitter,
        Self::Discord,
        Self::Onchain,
    ];
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PlatformError::InvalidRequest(format!("unknown platform: {}", s)))
    }
}

/// Platform adapter errors
///
/// These are surfaced verbatim in task executions and audit entries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// Capability not supported by this adapter
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Platform-side rate limit hit
    #[error("rate limited by platform")]
    RateLimited {
        /// Seconds until the platform accepts requests again
        retry_after_secs: Option<u64>,
    },

    /// Account suspended
    #[error("account suspended")]
    AccountSuspended,

    /// Post or user not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Follow target already followed
    #[error("already following")]
    AlreadyFollowing,

    /// Post already liked
    #[error("already liked")]
    AlreadyLiked,

    /// Request rejected as malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Anything else the platform reported
    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// Stable code stored with executions and audit entries
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::AccountSuspended => "ACCOUNT_SUSPENDED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyFollowing => "ALREADY_FOLLOWING",
            Self::AlreadyLiked => "ALREADY_LIKED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Other(_) => "PLATFORM_ERROR",
        }
    }

    /// Whether the same call may succeed later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network(_) | Self::Other(_))
    }
}

/// Result type for adapter calls
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Public profile of a platform user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Platform
    pub platform: Platform,
    /// Platform user id
    pub user_id: String,
    /// Handle
    pub username: String,
    /// Display name
    pub display_name: Option<String>,
    /// Biography
    pub bio: Option<String>,
    /// Avatar
    pub avatar_url: Option<String>,
    /// Followers
    pub followers: u64,
    /// Following
    pub following: u64,
    /// Verified badge
    pub verified: bool,
}

/// Content of a post, reply or quote
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostContent {
    /// Body text
    pub text: String,
    /// Attached media
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Target channel or chat, where the platform has one
    #[serde(default)]
    pub channel_id: Option<String>,
}

impl PostContent {
    /// Text-only content
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// A created post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostResult {
    /// Platform post id (cast hash, tweet id, message id)
    pub post_id: String,
    /// Public URL, if any
    pub url: Option<String>,
    /// Creation time
    pub posted_at: DateTime<Utc>,
}

/// Actions that can be checked after the fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyKind {
    /// Account follows target user
    Follow,
    /// Account liked target post
    Like,
    /// Account reposted target post
    Repost,
    /// Account replied to target post
    Reply,
    /// Account is a member of target channel
    Join,
}

/// Platform-reported quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Requests left
    pub remaining: u64,
    /// Requests per window
    pub limit: u64,
    /// When the window resets
    pub reset_at: Option<DateTime<Utc>>,
}

/// Social platform capability surface
///
/// One adapter serves every account on its platform; credentials are resolved
/// from `account_id` by the implementation.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform served by this adapter
    fn platform(&self) -> Platform;

    /// Validate the account's credentials
    async fn authenticate(&self, account_id: Uuid) -> PlatformResult<()> {
        let _ = account_id;
        Err(PlatformError::NotImplemented("authenticate".into()))
    }

    /// Fetch a profile; `username = None` means the account itself
    async fn get_profile(
        &self,
        account_id: Uuid,
        username: Option<&str>,
    ) -> PlatformResult<UserProfile> {
        let _ = (account_id, username);
        Err(PlatformError::NotImplemented("get_profile".into()))
    }

    /// Follow a user
    async fn follow(&self, account_id: Uuid, target_user: &str) -> PlatformResult<Proof> {
        let _ = (account_id, target_user);
        Err(PlatformError::NotImplemented("follow".into()))
    }

    /// Unfollow a user
    async fn unfollow(&self, account_id: Uuid, target_user: &str) -> PlatformResult<()> {
        let _ = (account_id, target_user);
        Err(PlatformError::NotImplemented("unfollow".into()))
    }

    /// Like a post
    async fn like(&self, account_id: Uuid, post_id: &str) -> PlatformResult<Proof> {
        let _ = (account_id, post_id);
        Err(PlatformError::NotImplemented("like".into()))
    }

    /// Remove a like
    async fn unlike(&self, account_id: Uuid, post_id: &str) -> PlatformResult<()> {
        let _ = (account_id, post_id);
        Err(PlatformError::NotImplemented("unlike".into()))
    }

    /// Repost / recast / retweet
    async fn repost(&self, account_id: Uuid, post_id: &str) -> PlatformResult<Proof> {
        let _ = (account_id, post_id);
        Err(PlatformError::NotImplemented("repost".into()))
    }

    /// Publish a post
    async fn post(&self, account_id: Uuid, content: &PostContent) -> PlatformResult<PostResult> {
        let _ = (account_id, content);
        Err(PlatformError::NotImplemented("post".into()))
    }

    /// Reply to a post
    async fn reply(
        &self,
        account_id: Uuid,
        parent_id: &str,
        content: &PostContent,
    ) -> PlatformResult<PostResult> {
        let _ = (account_id, parent_id, content);
        Err(PlatformError::NotImplemented("reply".into()))
    }

    /// Quote a post
    async fn quote(
        &self,
        account_id: Uuid,
        post_id: &str,
        content: &PostContent,
    ) -> PlatformResult<PostResult> {
        let _ = (account_id, post_id, content);
        Err(PlatformError::NotImplemented("quote".into()))
    }

    /// Delete one of the account's posts
    async fn delete_post(&self, account_id: Uuid, post_id: &str) -> PlatformResult<()> {
        let _ = (account_id, post_id);
        Err(PlatformError::NotImplemented("delete_post".into()))
    }

    /// Check that an action actually happened
    async fn verify_action(
        &self,
        account_id: Uuid,
        kind: VerifyKind,
        target: &str,
    ) -> PlatformResult<bool> {
        let _ = (account_id, kind, target);
        Err(PlatformError::NotImplemented("verify_action".into()))
    }

    /// Platform-side quota for the account
    async fn rate_limit_status(&self, account_id: Uuid) -> PlatformResult<RateLimitStatus> {
        let _ = account_id;
        Err(PlatformError::NotImplemented("rate_limit_status".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_round_trips_through_str() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert_eq!("Farcaster".parse::<Platform>().unwrap(), Platform::Farcaster);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(PlatformError::AlreadyFollowing.code(), "ALREADY_FOLLOWING");
        assert_eq!(PlatformError::AlreadyLiked.code(), "ALREADY_LIKED");
        assert_eq!(
            PlatformError::RateLimited {
                retry_after_secs: None
            }
            .code(),
            "RATE_LIMITED"
        );
        assert!(!PlatformError::AccountSuspended.is_retryable());
        assert!(PlatformError::Network("reset".into()).is_retryable());
    }
}
