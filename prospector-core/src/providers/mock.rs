//! In-process providers for tests and dry runs.
//!
//! Each mock records how often it was called so tests can assert that a
//! replayed step did not touch the provider again.

use super::{
    AgentJobState, AgentProvider, ChatMessage, ExtractedPage, ExtractionProvider,
    InferenceProvider, ProviderCatalog, SearchHit, SearchProvider,
};
use crate::config::ProviderConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type ErrorFactory = fn() -> PipelineError;

/// A transient error suitable for failure injection.
pub fn transient_error() -> PipelineError {
    PipelineError::Provider {
        provider: "mock".into(),
        status: Some(503),
        message: "service temporarily unavailable".into(),
    }
}

/// Pops an injected failure if one is queued.
struct FailurePlan(Mutex<VecDeque<ErrorFactory>>);

impl FailurePlan {
    fn new() -> Self {
        Self(Mutex::new(VecDeque::new()))
    }

    fn push(&self, times: usize, factory: ErrorFactory) {
        let mut queue = self.0.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..times {
            queue.push_back(factory);
        }
    }

    fn next(&self) -> Option<PipelineError> {
        let mut queue = self.0.lock().unwrap_or_else(|e| e.into_inner());
        queue.pop_front().map(|f| f())
    }
}

/// Search mock returning fixed hits, optionally per query.
pub struct MockSearch {
    default_hits: Vec<SearchHit>,
    by_query: HashMap<String, Vec<SearchHit>>,
    failures: FailurePlan,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            default_hits: hits,
            by_query: HashMap::new(),
            failures: FailurePlan::new(),
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Hits for `https://example.com/{prefix}-{i}` with i in `0..count`.
    pub fn with_urls(prefix: &str, count: usize) -> Self {
        Self::new(hits(prefix, count))
    }

    pub fn on_query(mut self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.by_query.insert(query.to_string(), hits);
        self
    }

    pub fn fail_times(self, times: usize, factory: ErrorFactory) -> Self {
        self.failures.push(times, factory);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Build `count` distinct hits.
pub fn hits(prefix: &str, count: usize) -> Vec<SearchHit> {
    (0..count)
        .map(|i| SearchHit {
            url: format!("https://example.com/{prefix}-{i}"),
            title: format!("{prefix} {i}"),
            snippet: format!("Snippet about {prefix} {i}"),
        })
        .collect()
}

#[async_trait]
impl SearchProvider for MockSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let hits = self.by_query.get(query).unwrap_or(&self.default_hits);
        Ok(hits.iter().take(limit).cloned().collect())
    }

    fn name(&self) -> &str {
        "mock-search"
    }
}

/// Extraction mock that echoes the URL as page content.
pub struct MockExtractor {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionProvider for MockExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedPage, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(url) {
            return Err(PipelineError::Provider {
                provider: "mock-extractor".into(),
                status: Some(404),
                message: format!("{url} not found"),
            });
        }
        Ok(ExtractedPage::from_content(
            url,
            &format!("Page {url}"),
            format!("Full article text retrieved from {url}."),
        ))
    }

    fn name(&self) -> &str {
        "mock-extractor"
    }
}

/// Inference mock routing on substrings of the last message.
pub struct MockInference {
    name: String,
    rules: Vec<(String, String)>,
    fallback: String,
    failures: FailurePlan,
    latency: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockInference {
    pub fn new() -> Self {
        Self::named("mock-inference")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            fallback: "{}".to_string(),
            failures: FailurePlan::new(),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `response` whenever the prompt contains `needle`.
    pub fn respond_when(mut self, needle: &str, response: impl Into<String>) -> Self {
        self.rules.push((needle.to_string(), response.into()));
        self
    }

    pub fn fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = response.into();
        self
    }

    pub fn fail_times(self, times: usize, factory: ErrorFactory) -> Self {
        self.failures.push(times, factory);
        self
    }

    /// Hold every reply for `latency`, ignoring cancellation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls whose prompt contained `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }
}

impl Default for MockInference {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceProvider for MockInference {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.fallback.clone());
        Ok(reply)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

/// Agent mock that stays running for a fixed number of checks.
pub struct MockAgent {
    running_checks: usize,
    outcome: AgentJobState,
    starts: AtomicUsize,
    checks: AtomicUsize,
}

impl MockAgent {
    pub fn completing_after(running_checks: usize, sources: Vec<SearchHit>) -> Self {
        Self {
            running_checks,
            outcome: AgentJobState::Completed {
                sources,
                analysis: Some("Agent summary".into()),
            },
            starts: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(running_checks: usize, message: &str) -> Self {
        Self {
            running_checks,
            outcome: AgentJobState::Failed {
                message: message.to_string(),
            },
            starts: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn never_finishing() -> Self {
        Self::completing_after(usize::MAX, Vec::new())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentProvider for MockAgent {
    async fn start_job(&self, _query: &str, _max_sources: usize) -> Result<String, PipelineError> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock-job-{}", n + 1))
    }

    async fn job_status(&self, _job_id: &str) -> Result<AgentJobState, PipelineError> {
        let n = self.checks.fetch_add(1, Ordering::SeqCst);
        if n < self.running_checks {
            Ok(AgentJobState::Running)
        } else {
            Ok(self.outcome.clone())
        }
    }

    fn name(&self) -> &str {
        "mock-agent"
    }
}

/// Catalog serving registered mocks by provider name.
///
/// Unregistered names fail construction like an unknown provider would, so
/// the resolver falls back exactly as it does with real clients.
#[derive(Default)]
pub struct MockCatalog {
    inference: HashMap<String, Arc<dyn InferenceProvider>>,
    search: HashMap<String, Arc<dyn SearchProvider>>,
    extraction: HashMap<String, Arc<dyn ExtractionProvider>>,
    agent: HashMap<String, Arc<dyn AgentProvider>>,
    built: Mutex<Vec<(String, Option<String>)>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inference(mut self, provider: &str, client: Arc<dyn InferenceProvider>) -> Self {
        self.inference.insert(provider.to_string(), client);
        self
    }

    pub fn with_search(mut self, provider: &str, client: Arc<dyn SearchProvider>) -> Self {
        self.search.insert(provider.to_string(), client);
        self
    }

    pub fn with_extraction(mut self, provider: &str, client: Arc<dyn ExtractionProvider>) -> Self {
        self.extraction.insert(provider.to_string(), client);
        self
    }

    pub fn with_agent(mut self, provider: &str, client: Arc<dyn AgentProvider>) -> Self {
        self.agent.insert(provider.to_string(), client);
        self
    }

    /// `(provider, model)` of every inference client handed out, in order.
    pub fn inference_builds(&self) -> Vec<(String, Option<String>)> {
        self.built.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lookup<C: ?Sized>(
        map: &HashMap<String, Arc<C>>,
        kind: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<C>, PipelineError> {
        map.get(&config.provider).cloned().ok_or_else(|| {
            PipelineError::configuration(format!("Unknown {kind} provider '{}'", config.provider))
        })
    }
}

impl ProviderCatalog for MockCatalog {
    fn inference(
        &self,
        config: &ProviderConfig,
        _credential: Option<String>,
        _timeout_secs: u64,
    ) -> Result<Arc<dyn InferenceProvider>, PipelineError> {
        let client = Self::lookup(&self.inference, "inference", config)?;
        self.built
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((config.provider.clone(), config.model.clone()));
        Ok(client)
    }

    fn search(
        &self,
        config: &ProviderConfig,
        _credential: Option<String>,
        _timeout_secs: u64,
    ) -> Result<Arc<dyn SearchProvider>, PipelineError> {
        Self::lookup(&self.search, "search", config)
    }

    fn extraction(
        &self,
        config: &ProviderConfig,
        _credential: Option<String>,
        _timeout_secs: u64,
    ) -> Result<Arc<dyn ExtractionProvider>, PipelineError> {
        Self::lookup(&self.extraction, "extraction", config)
    }

    fn agent(
        &self,
        config: &ProviderConfig,
        _credential: Option<String>,
        _timeout_secs: u64,
    ) -> Result<Arc<dyn AgentProvider>, PipelineError> {
        Self::lookup(&self.agent, "agent", config)
    }
}
