mod anthropic;
mod error;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::VendorError;
pub use types::{ChatRequest, ChatResponse, Message, ModelInfo, ModelTier, Role, Usage};

use async_trait::async_trait;

/// An LLM vendor. The core talks to exactly one of these through the
/// subagent dispatcher; implementations stay stateless beyond the HTTP
/// client.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn supported_models(&self) -> &[ModelInfo];

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, VendorError>;

    /// Cheapest model matching the tier, or the first supported model.
    fn model_for_tier(&self, tier: ModelTier) -> &ModelInfo {
        self.supported_models()
            .iter()
            .find(|m| m.tier == tier)
            .unwrap_or(&self.supported_models()[0])
    }
}
