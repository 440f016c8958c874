//! OpenAI-compatible inference provider.
//!
//! Supports OpenAI, OpenRouter, Groq, Together, Ollama and any endpoint that
//! follows the OpenAI chat completions API format.

use super::{ChatMessage, InferenceProvider, send_json};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "ollama" => "http://localhost:11434/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiCompatibleClient {
    client: Client,
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleClient {
    /// Create a client. Local endpoints run without a key.
    pub fn new(
        config: &ProviderConfig,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(&config.provider).to_string());
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");

        let api_key = match api_key {
            Some(key) => key,
            None if is_local => {
                debug!("No API key set for local provider; using dummy bearer token");
                "ollama".to_string()
            }
            None => {
                return Err(PipelineError::configuration(format!(
                    "Provider '{}' requires an API key",
                    config.provider
                )));
            }
        };

        url::Url::parse(&base_url).map_err(|e| {
            PipelineError::configuration(format!("Invalid base_url '{base_url}': {e}"))
        })?;

        Ok(Self {
            client: super::http_client(timeout_secs)?,
            provider: config.provider.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], temperature: f32) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        })
    }

    fn parse_reply(&self, body: &Value) -> Result<String, PipelineError> {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::malformed(&self.provider, "response has no message content"))
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatibleClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, PipelineError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, messages = messages.len(), "Sending chat completion");

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(messages, temperature));
        let body: Value = send_json(&self.provider, request).await?;
        self.parse_reply(&body)
    }

    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
