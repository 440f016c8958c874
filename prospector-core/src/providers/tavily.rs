//! Tavily web search.

use super::{SearchHit, SearchProvider, send_json};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

#[derive(Debug, Serialize)]
struct TavilySearchRequest<'a> {
    query: &'a str,
    search_depth: &'static str,
    max_results: usize,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

pub struct TavilySearch {
    client: Client,
    base_url: String,
    api_key: String,
}

impl TavilySearch {
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
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, PipelineError> {
        debug!(query = %query, limit, "Searching Tavily");
        let request = self
            .client
            .post(format!("{}/search", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&TavilySearchRequest {
                query,
                search_depth: "basic",
                max_results: limit,
                include_answer: false,
                include_raw_content: false,
            });
        let response: TavilySearchResponse = send_json("tavily", request).await?;
        Ok(response
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .map(|r| SearchHit {
                url: r.url.trim().to_string(),
                title: r.title.unwrap_or_else(|| "Untitled".to_string()),
                snippet: r.content.unwrap_or_default(),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "tavily"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_requires_results_array() {
        assert!(serde_json::from_str::<TavilySearchResponse>(r#"{"answer": null}"#).is_err());
        let response: TavilySearchResponse = serde_json::from_str(
            r#"{"results": [{"url": "https://a.test", "title": "A", "content": "c"}]}"#,
        )
        .unwrap();
        assert_eq!(response.results[0].content.as_deref(), Some("c"));
    }
}
