use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::PlatformResult;

/// What to generate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRequest {
    /// Prompt or topic
    pub prompt: String,
    /// Kind of content, e.g. `post` or `reply`
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Voice or style hint
    #[serde(default)]
    pub tone: Option<String>,
}

fn default_content_type() -> String {
    "post".to_string()
}

/// Generated text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    /// Body text
    pub text: String,
}

/// Text generation collaborator
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Produce one piece of content
    async fn generate(&self, request: &ContentRequest) -> PlatformResult<GeneratedContent>;
}
