use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Model capability tiers in ascending cost order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// Flat per-call cost estimate in dollars, used when the vendor does
    /// not return token usage.
    pub fn flat_cost(&self) -> f64 {
        match self {
            ModelTier::Haiku => 0.005,
            ModelTier::Sonnet => 0.03,
            ModelTier::Opus => 0.10,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Haiku => write!(f, "haiku"),
            ModelTier::Sonnet => write!(f, "sonnet"),
            ModelTier::Opus => write!(f, "opus"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub tier: ModelTier,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub input_price_per_m: f64,
    pub output_price_per_m: f64,
}

impl ModelInfo {
    /// Dollar cost of a completed call given real token usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let input = usage.input_tokens as f64 * self.input_price_per_m / 1_000_000.0;
        let output = usage.output_tokens as f64 * self.output_price_per_m / 1_000_000.0;
        input + output
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Empty selects the provider's default model for the requested tier.
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(ModelTier::Haiku < ModelTier::Sonnet);
        assert!(ModelTier::Sonnet < ModelTier::Opus);
        assert!(ModelTier::Haiku.flat_cost() < ModelTier::Opus.flat_cost());
    }

    #[test]
    fn test_usage_cost() {
        let model = ModelInfo {
            id: "m",
            name: "m",
            tier: ModelTier::Sonnet,
            context_window: 200_000,
            max_output_tokens: 16_384,
            input_price_per_m: 3.0,
            output_price_per_m: 15.0,
        };
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        assert!((model.cost(&usage) - 18.0).abs() < 1e-9);
    }
}
