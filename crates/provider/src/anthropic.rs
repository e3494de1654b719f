use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::types::*;
use crate::{Provider, VendorError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

static MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-haiku-3-5-20241022",
        name: "Claude 3.5 Haiku",
        tier: ModelTier::Haiku,
        context_window: 200_000,
        max_output_tokens: 8_192,
        input_price_per_m: 0.8,
        output_price_per_m: 4.0,
    },
    ModelInfo {
        id: "claude-sonnet-4-20250514",
        name: "Claude Sonnet 4",
        tier: ModelTier::Sonnet,
        context_window: 200_000,
        max_output_tokens: 16_384,
        input_price_per_m: 3.0,
        output_price_per_m: 15.0,
    },
    ModelInfo {
        id: "claude-opus-4-20250514",
        name: "Claude Opus 4",
        tier: ModelTier::Opus,
        context_window: 200_000,
        max_output_tokens: 32_768,
        input_price_per_m: 15.0,
        output_price_per_m: 75.0,
    },
];

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    pub fn from_config(config: &sneebly_config::Config) -> Result<Self> {
        let api_key = config
            .provider
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SNEEBLY_API_KEY is not set"))?;
        Ok(Self::new(api_key, config.provider.base_url.clone()))
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<serde_json::Value> {
        request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|msg| {
                json!({
                    "role": match msg.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": msg.content,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supported_models(&self) -> &[ModelInfo] {
        MODELS
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, VendorError> {
        let model = if request.model.is_empty() {
            MODELS[1].id
        } else {
            &request.model
        };

        let mut body = json!({
            "model": model,
            "messages": self.build_messages(request),
            "max_tokens": request.max_tokens.unwrap_or(4096),
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| VendorError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp.text().await.unwrap_or_default();
            return Err(VendorError::from_http(
                status.as_u16(),
                body,
                retry_after.as_deref(),
            ));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VendorError::Malformed(e.to_string()))?;

        let content = data["content"][0]["text"]
            .as_str()
            .unwrap_or("")
            .to_string();

        let usage = data.get("usage").map(|u| Usage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(ChatResponse {
            content,
            usage,
            stop_reason: data["stop_reason"].as_str().map(String::from),
        })
    }
}
