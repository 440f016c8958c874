//! Research-level operations on top of a chat-capable inference provider.

use super::{ChatMessage, InferenceProvider};
use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a meticulous market research analyst. \
Answer only with the JSON requested, without commentary.";

/// An insight proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightDraft {
    pub title: String,
    pub detail: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
}

/// Output of `analyze_content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub insights: Vec<InsightDraft>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub trends: Vec<String>,
}

/// Output of `identify_gaps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapAnalysis {
    pub has_gaps: bool,
    #[serde(default)]
    pub suggested_queries: Vec<String>,
}

/// Wraps an inference provider with the prompts the pipeline needs.
#[derive(Clone)]
pub struct ResearchModel {
    provider: Arc<dyn InferenceProvider>,
    temperature: f32,
}

impl ResearchModel {
    pub fn new(provider: Arc<dyn InferenceProvider>, temperature: f32) -> Self {
        Self {
            provider,
            temperature,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, PipelineError> {
        self.provider.chat(messages, self.temperature).await
    }

    /// Summarise a corpus into insights and trends for `topic`.
    pub async fn analyze_content(
        &self,
        topic: &str,
        corpus: &str,
    ) -> Result<AnalysisResult, PipelineError> {
        let prompt = format!(
            "Task: analyze-content\n\
             Topic: {topic}\n\n\
             Read the sources below and return JSON of the form \
             {{\"insights\": [{{\"title\": str, \"detail\": str, \"category\": str, \"source_urls\": [str]}}], \
             \"summary\": str, \"trends\": [str]}}.\n\n\
             Sources:\n{corpus}"
        );
        self.generate_json(&prompt).await
    }

    /// Decide whether the corpus leaves open questions about `query`.
    pub async fn identify_gaps(
        &self,
        query: &str,
        corpus: &str,
    ) -> Result<GapAnalysis, PipelineError> {
        let prompt = format!(
            "Task: identify-gaps\n\
             Research question: {query}\n\n\
             Given the material gathered so far, return JSON of the form \
             {{\"has_gaps\": bool, \"suggested_queries\": [str]}} listing at most three \
             follow-up search queries that would fill the most important gaps.\n\n\
             Material:\n{corpus}"
        );
        self.generate_json(&prompt).await
    }

    /// Ask for JSON and decode it into `T`.
    pub async fn generate_json<T: DeserializeOwned>(&self, prompt: &str) -> Result<T, PipelineError> {
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let reply = self.chat(&messages).await?;
        debug!(
            provider = self.provider.name(),
            model = self.provider.model_name(),
            chars = reply.len(),
            "Received JSON reply"
        );
        let block = extract_json_block(&reply).ok_or_else(|| {
            PipelineError::malformed(self.provider.name(), "reply contains no JSON")
        })?;
        serde_json::from_str(block)
            .map_err(|e| PipelineError::malformed(self.provider.name(), e.to_string()))
    }
}

/// Extract a JSON block from model output. Tries a fenced ```json block first,
/// then the outermost `{...}` or `[...]` span.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + "```json".len();
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }

    let open = trimmed.find(['{', '['])?;
    let close_char = if trimmed[open..].starts_with('{') { '}' } else { ']' };
    let close = trimmed.rfind(close_char)?;
    (close > open).then(|| &trimmed[open..=close])
}
