//! Anthropic Messages API provider.
//!
//! Differences from the OpenAI format:
//! - System prompt is a top-level `system` field, not a message
//! - Auth via `x-api-key` header (not `Authorization: Bearer`)
//! - Required `anthropic-version` header

use super::{ChatMessage, InferenceProvider, Role, send_json};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(
        config: &ProviderConfig,
        api_key: String,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: super::http_client(timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], temperature: f32) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        body
    }

    fn parse_reply(body: &Value) -> Result<String, PipelineError> {
        let text: String = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| PipelineError::malformed("anthropic", "response has no content blocks"))?
            .iter()
            .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect();
        if text.is_empty() {
            return Err(PipelineError::malformed("anthropic", "response has no text"));
        }
        Ok(text)
    }
}

#[async_trait]
impl InferenceProvider for AnthropicClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, PipelineError> {
        let url = format!("{}/messages", self.base_url);
        debug!(model = self.model.as_str(), url = url.as_str(), "Sending Anthropic request");

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.request_body(messages, temperature));
        let body: Value = send_json("anthropic", request).await?;
        Self::parse_reply(&body)
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
