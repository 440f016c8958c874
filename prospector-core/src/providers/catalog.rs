//! Construction of concrete provider clients.

use super::anthropic::AnthropicClient;
use super::direct::DirectFetchExtractor;
use super::exa::ExaSearch;
use super::firecrawl::{FirecrawlAgent, FirecrawlExtractor};
use super::openai_compat::OpenAiCompatibleClient;
use super::tavily::TavilySearch;
use super::{AgentProvider, ExtractionProvider, InferenceProvider, SearchProvider};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use std::sync::Arc;

/// Builds capability clients from a candidate config and its resolved credential.
pub trait ProviderCatalog: Send + Sync {
    fn inference(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn InferenceProvider>, PipelineError>;

    fn search(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn SearchProvider>, PipelineError>;

    fn extraction(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn ExtractionProvider>, PipelineError>;

    fn agent(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn AgentProvider>, PipelineError>;
}

/// The real HTTP-backed providers.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProviderCatalog;

fn require_key(config: &ProviderConfig, credential: Option<String>) -> Result<String, PipelineError> {
    credential.ok_or_else(|| {
        PipelineError::configuration(format!("Provider '{}' requires an API key", config.provider))
    })
}

fn unknown(kind: &str, config: &ProviderConfig) -> PipelineError {
    PipelineError::configuration(format!("Unknown {kind} provider '{}'", config.provider))
}

impl ProviderCatalog for HttpProviderCatalog {
    fn inference(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn InferenceProvider>, PipelineError> {
        match config.provider.as_str() {
            "anthropic" => Ok(Arc::new(AnthropicClient::new(
                config,
                require_key(config, credential)?,
                timeout_secs,
            )?)),
            // Ollama and other local servers run without a key.
            "openai" | "openrouter" | "groq" | "together" | "ollama" | "openai-compatible" => {
                Ok(Arc::new(OpenAiCompatibleClient::new(
                    config,
                    credential,
                    timeout_secs,
                )?))
            }
            _ => Err(unknown("inference", config)),
        }
    }

    fn search(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn SearchProvider>, PipelineError> {
        match config.provider.as_str() {
            "exa" => Ok(Arc::new(ExaSearch::new(
                config,
                require_key(config, credential)?,
                timeout_secs,
            )?)),
            "tavily" => Ok(Arc::new(TavilySearch::new(
                config,
                require_key(config, credential)?,
                timeout_secs,
            )?)),
            _ => Err(unknown("search", config)),
        }
    }

    fn extraction(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn ExtractionProvider>, PipelineError> {
        match config.provider.as_str() {
            "firecrawl" => Ok(Arc::new(FirecrawlExtractor::new(
                config,
                require_key(config, credential)?,
                timeout_secs,
            )?)),
            "direct" => Ok(Arc::new(DirectFetchExtractor::new(timeout_secs)?)),
            _ => Err(unknown("extraction", config)),
        }
    }

    fn agent(
        &self,
        config: &ProviderConfig,
        credential: Option<String>,
        timeout_secs: u64,
    ) -> Result<Arc<dyn AgentProvider>, PipelineError> {
        match config.provider.as_str() {
            "firecrawl" => Ok(Arc::new(FirecrawlAgent::new(
                config,
                require_key(config, credential)?,
                timeout_secs,
            )?)),
            _ => Err(unknown("agent", config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: &str) -> ProviderConfig {
        ProviderConfig {
            provider: provider.into(),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn test_builds_known_providers() {
        let catalog = HttpProviderCatalog;
        let client = catalog
            .inference(&cfg("openai"), Some("sk-test".into()), 30)
            .unwrap();
        assert_eq!(client.name(), "openai");
        assert!(catalog.search(&cfg("tavily"), Some("tv".into()), 30).is_ok());
        assert!(catalog.extraction(&cfg("direct"), None, 30).is_ok());
        assert!(catalog.agent(&cfg("firecrawl"), Some("fc".into()), 30).is_ok());
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let err = HttpProviderCatalog
            .search(&cfg("exa"), None, 30)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn test_unknown_provider() {
        let err = HttpProviderCatalog
            .inference(&cfg("nonsense"), Some("k".into()), 30)
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Configuration error: Unknown inference provider 'nonsense'"
        );
    }
}
