//! Exa neural search.

use super::{SearchHit, SearchProvider, send_json};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.exa.ai";
const SNIPPET_CHARS: usize = 500;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaSearchRequest<'a> {
    query: &'a str,
    num_results: usize,
    #[serde(rename = "type")]
    search_type: &'static str,
    contents: ExaContents,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaContents {
    text: ExaTextConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaTextConfig {
    max_characters: usize,
}

#[derive(Debug, Deserialize)]
struct ExaSearchResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Debug, Deserialize)]
struct ExaResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

pub struct ExaSearch {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ExaSearch {
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
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        })
    }

    fn into_hits(response: ExaSearchResponse) -> Vec<SearchHit> {
        response
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .map(|r| SearchHit {
                url: r.url.trim().to_string(),
                title: r.title.unwrap_or_else(|| "Untitled".to_string()),
                snippet: r
                    .text
                    .unwrap_or_default()
                    .chars()
                    .take(SNIPPET_CHARS)
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for ExaSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, PipelineError> {
        debug!(query = %query, limit, "Searching Exa");
        let request = self
            .client
            .post(format!("{}/search", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .json(&ExaSearchRequest {
                query,
                num_results: limit,
                search_type: "auto",
                contents: ExaContents {
                    text: ExaTextConfig {
                        max_characters: 2_000,
                    },
                },
            });
        let response: ExaSearchResponse = send_json("exa", request).await?;
        Ok(Self::into_hits(response))
    }

    fn name(&self) -> &str {
        "exa"
    }
}
