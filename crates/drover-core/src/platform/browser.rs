use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::PlatformResult;

/// Handle to a running browser session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSession {
    /// Provider-assigned session id
    pub id: String,
    /// Profile the session was started from
    pub profile: String,
}

/// One scripted step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrowserAction {
    /// Open a URL
    Navigate {
        /// Target
        url: String,
    },
    /// Click an element
    Click {
        /// CSS selector
        selector: String,
    },
    /// Type into an element
    Type {
        /// CSS selector
        selector: String,
        /// Text to type
        text: String,
    },
    /// Wait for an element to appear
    WaitFor {
        /// CSS selector
        selector: String,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
}

/// Outcome of a scripted step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserActionResult {
    /// Whether the step succeeded
    pub success: bool,
    /// Free-form output
    pub output: Option<String>,
}

/// Isolated browser sessions
#[async_trait]
pub trait BrowserSessionProvider: Send + Sync {
    /// Start a session from a stored profile
    async fn start_session(&self, profile: &str) -> PlatformResult<BrowserSession>;

    /// Run one step
    async fn execute_action(
        &self,
        session: &BrowserSession,
        action: &BrowserAction,
    ) -> PlatformResult<BrowserActionResult>;

    /// Capture the current page; returns the stored image path
    async fn screenshot(&self, session: &BrowserSession) -> PlatformResult<String>;

    /// Tear the session down
    async fn stop_session(&self, session: &BrowserSession) -> PlatformResult<()>;
}
