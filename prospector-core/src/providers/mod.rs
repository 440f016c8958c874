//! Capability provider clients.
//!
//! Three capability families feed the pipeline, plus autonomous research agents:
//! - Search: Exa, Tavily
//! - Extraction: Firecrawl scrape, direct HTTP fetch
//! - Inference: OpenAI-compatible APIs (OpenAI, OpenRouter, Groq, Ollama), Anthropic
//! - Agent: Firecrawl deep research
//!
//! Clients are built through a [`ProviderCatalog`] and chosen by the
//! [`ProviderResolver`], which falls back from primary to secondary when a
//! candidate cannot be constructed.

pub mod anthropic;
pub mod catalog;
pub mod direct;
pub mod exa;
pub mod firecrawl;
pub mod mock;
pub mod model;
pub mod openai_compat;
pub mod resolver;
pub mod tavily;

use crate::error::PipelineError;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use catalog::{HttpProviderCatalog, ProviderCatalog};
pub use model::{AnalysisResult, GapAnalysis, ResearchModel};
pub use resolver::{ProviderOverride, ProviderResolver, Resolved};

/// Concurrent extractions issued by the default `extract_multiple`.
const EXTRACT_CONCURRENCY: usize = 4;

/// The capability a provider offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Inference,
    Search,
    Extraction,
    Agent,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Inference => write!(f, "inference"),
            Capability::Search => write!(f, "search"),
            Capability::Extraction => write!(f, "extraction"),
            Capability::Agent => write!(f, "agent"),
        }
    }
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// The outcome of extracting one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub url: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub success: bool,
}

impl ExtractedPage {
    pub fn failed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: String::new(),
            content: String::new(),
            excerpt: String::new(),
            success: false,
        }
    }

    pub fn from_content(url: &str, title: &str, content: String) -> Self {
        let excerpt = content.chars().take(280).collect();
        Self {
            url: url.to_string(),
            title: title.to_string(),
            success: !content.trim().is_empty(),
            content,
            excerpt,
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to an inference provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// State of a remote autonomous research job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentJobState {
    Running,
    Completed {
        sources: Vec<SearchHit>,
        #[serde(default)]
        analysis: Option<String>,
    },
    Failed {
        message: String,
    },
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, PipelineError>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ExtractedPage, PipelineError>;

    /// Extract several URLs. Per-URL failures are reported as `success = false`
    /// so one bad page does not sink the batch; results keep the input order.
    async fn extract_multiple(&self, urls: &[String]) -> Vec<ExtractedPage> {
        futures::stream::iter(urls.iter().cloned())
            .map(move |url| async move {
                match self.extract(&url).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::warn!(url = %url, provider = self.name(), error = %e, "Extraction failed");
                        ExtractedPage::failed(&url)
                    }
                }
            })
            .buffered(EXTRACT_CONCURRENCY)
            .collect()
            .await
    }

    fn name(&self) -> &str;
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], temperature: f32)
    -> Result<String, PipelineError>;

    fn name(&self) -> &str;

    fn model_name(&self) -> &str;
}

#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Start a remote job and return its id.
    async fn start_job(&self, query: &str, max_sources: usize) -> Result<String, PipelineError>;

    async fn job_status(&self, job_id: &str) -> Result<AgentJobState, PipelineError>;

    fn name(&self) -> &str;
}

/// Build the shared HTTP client used by the provider implementations.
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
        .user_agent(concat!("prospector/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PipelineError::configuration(format!("Failed to build HTTP client: {e}")))
}

/// Send a request and decode a JSON body, mapping HTTP and transport errors.
pub(crate) async fn send_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, PipelineError> {
    let response = request
        .send()
        .await
        .map_err(|e| PipelineError::from_reqwest(provider, e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PipelineError::from_reqwest(provider, e))?;
    if !status.is_success() {
        return Err(PipelineError::from_status(provider, status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| PipelineError::malformed(provider, e.to_string()))
}
