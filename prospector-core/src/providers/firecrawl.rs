//! Firecrawl scrape (extraction) and deep research (autonomous agent).

use super::{
    AgentJobState, AgentProvider, ExtractedPage, ExtractionProvider, SearchHit, send_json,
};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.firecrawl.dev/v1";

fn base_url(config: &ProviderConfig) -> String {
    config
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeRequest<'a> {
    url: &'a str,
    formats: [&'static str; 1],
    only_main_content: bool,
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ScrapeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    metadata: Option<ScrapeMetadata>,
}

#[derive(Debug, Deserialize)]
struct ScrapeMetadata {
    #[serde(default)]
    title: Option<String>,
}

pub struct FirecrawlExtractor {
    client: Client,
    base_url: String,
    api_key: String,
}

impl FirecrawlExtractor {
    pub fn new(
        config: &ProviderConfig,
        api_key: String,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: super::http_client(timeout_secs)?,
            base_url: base_url(config),
            api_key,
        })
    }

    fn into_page(url: &str, response: ScrapeResponse) -> Result<ExtractedPage, PipelineError> {
        if !response.success {
            return Err(PipelineError::Provider {
                provider: "firecrawl".into(),
                status: None,
                message: response.error.unwrap_or_else(|| "scrape failed".into()),
            });
        }
        let data = response
            .data
            .ok_or_else(|| PipelineError::malformed("firecrawl", "scrape response has no data"))?;
        let title = data
            .metadata
            .and_then(|m| m.title)
            .unwrap_or_default();
        Ok(ExtractedPage::from_content(
            url,
            &title,
            data.markdown.unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl ExtractionProvider for FirecrawlExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedPage, PipelineError> {
        debug!(url = %url, "Scraping with Firecrawl");
        let request = self
            .client
            .post(format!("{}/scrape", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ScrapeRequest {
                url,
                formats: ["markdown"],
                only_main_content: true,
            });
        let response: ScrapeResponse = send_json("firecrawl", request).await?;
        Self::into_page(url, response)
    }

    fn name(&self) -> &str {
        "firecrawl"
    }
}

// ---------------------------------------------------------------------------
// Deep research
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeepResearchRequest<'a> {
    query: &'a str,
    max_urls: usize,
    max_depth: u32,
}

#[derive(Debug, Deserialize)]
struct DeepResearchStarted {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeepResearchStatus {
    status: String,
    #[serde(default)]
    data: Option<DeepResearchData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeepResearchData {
    #[serde(default)]
    final_analysis: Option<String>,
    #[serde(default)]
    sources: Vec<DeepResearchSource>,
}

#[derive(Debug, Deserialize)]
struct DeepResearchSource {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub struct FirecrawlAgent {
    client: Client,
    base_url: String,
    api_key: String,
}

impl FirecrawlAgent {
    pub fn new(
        config: &ProviderConfig,
        api_key: String,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: super::http_client(timeout_secs)?,
            base_url: base_url(config),
            api_key,
        })
    }

    fn into_state(status: DeepResearchStatus) -> Result<AgentJobState, PipelineError> {
        match status.status.as_str() {
            "processing" | "pending" | "queued" => Ok(AgentJobState::Running),
            "completed" => {
                let data = status.data.unwrap_or(DeepResearchData {
                    final_analysis: None,
                    sources: Vec::new(),
                });
                Ok(AgentJobState::Completed {
                    sources: data
                        .sources
                        .into_iter()
                        .map(|s| SearchHit {
                            title: s.title.unwrap_or_else(|| "Untitled".to_string()),
                            snippet: s.description.unwrap_or_default(),
                            url: s.url,
                        })
                        .collect(),
                    analysis: data.final_analysis,
                })
            }
            "failed" | "cancelled" => Ok(AgentJobState::Failed {
                message: status
                    .error
                    .unwrap_or_else(|| format!("deep research {}", status.status)),
            }),
            other => Err(PipelineError::malformed(
                "firecrawl",
                format!("unknown deep research status '{other}'"),
            )),
        }
    }
}

#[async_trait]
impl AgentProvider for FirecrawlAgent {
    async fn start_job(&self, query: &str, max_sources: usize) -> Result<String, PipelineError> {
        let request = self
            .client
            .post(format!("{}/deep-research", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&DeepResearchRequest {
                query,
                max_urls: max_sources,
                max_depth: 3,
            });
        let started: DeepResearchStarted = send_json("firecrawl", request).await?;
        match (started.success, started.id) {
            (true, Some(id)) => {
                debug!(job_id = %id, "Started Firecrawl deep research");
                Ok(id)
            }
            (_, _) => Err(PipelineError::Provider {
                provider: "firecrawl".into(),
                status: None,
                message: started
                    .error
                    .unwrap_or_else(|| "deep research did not return a job id".into()),
            }),
        }
    }

    async fn job_status(&self, job_id: &str) -> Result<AgentJobState, PipelineError> {
        let request = self
            .client
            .get(format!(
                "{}/deep-research/{}",
                self.base_url,
                urlencoding::encode(job_id)
            ))
            .bearer_auth(&self.api_key);
        let status: DeepResearchStatus = send_json("firecrawl", request).await?;
        Self::into_state(status)
    }

    fn name(&self) -> &str {
        "firecrawl"
    }
}
