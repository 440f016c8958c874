//! Trigger payloads and the static stage graph.

use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::progress::milestones;
use crate::providers::ProviderOverride;
use crate::store::JobSettings;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const FETCH_CONFIG_STEP: &str = "fetch-config";
pub const DISCOVER_STEP: &str = "discover";
pub const AGENT_START_STEP: &str = "discover-agent-start";
pub const ANALYZE_STEP: &str = "analyze";
pub const GENERATE_ACTIONS_STEP: &str = "generate-actions";
pub const GENERATE_LEADS_STEP: &str = "generate-leads";
pub const FINALIZE_STEP: &str = "finalize";

/// Step name of one pass of the iterative discovery loop (1-based).
pub fn iteration_step(iteration: u32) -> String {
    format!("{DISCOVER_STEP}-iteration-{iteration}")
}

/// Event that starts, resumes or retries a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub run_id: String,
    pub job_id: String,
    pub payload: ResearchRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_options: Option<RetryOptions>,
}

/// What to research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub topic: String,
    #[serde(default)]
    pub include_leads: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DiscoveryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sources: Option<usize>,
}

impl ResearchRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            include_leads: false,
            strategy: None,
            max_sources: None,
        }
    }
}

/// Options attached to a retry of a failed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Reuse persisted sources instead of discovering again.
    #[serde(default)]
    pub skip_discovery: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_model: Option<String>,
}

impl RetryOptions {
    pub fn inference_override(&self) -> ProviderOverride {
        ProviderOverride {
            provider: self.inference_provider.clone(),
            model: self.inference_model.clone(),
        }
    }
}

/// How the discover stage gathers sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// One search, then extraction of every hit.
    Standard,
    /// Repeated search rounds steered by gap analysis.
    IterativeLoop { max_iterations: u32 },
    /// A remote research agent, polled until it finishes.
    AutonomousAgent,
    /// Sources already persisted for this job.
    ReusePrevious,
}

impl DiscoveryStrategy {
    /// Parse a configured strategy name.
    pub fn from_name(name: &str, max_iterations: u32) -> Result<Self, PipelineError> {
        match name.trim().to_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(Self::Standard),
            "iterative" | "iterative_loop" => Ok(Self::IterativeLoop {
                max_iterations: max_iterations.max(1),
            }),
            "agent" | "autonomous_agent" => Ok(Self::AutonomousAgent),
            "reuse" | "reuse_previous" => Ok(Self::ReusePrevious),
            other => Err(PipelineError::configuration(format!(
                "Unknown discovery strategy '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::IterativeLoop { max_iterations } => write!(f, "iterative({max_iterations})"),
            Self::AutonomousAgent => write!(f, "autonomous-agent"),
            Self::ReusePrevious => write!(f, "reuse-previous"),
        }
    }
}

/// The job as the run executes it: trigger payload merged with configuration
/// and per-job settings. This is the cached result of `fetch-config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedJob {
    pub job_id: String,
    pub topic: String,
    pub include_leads: bool,
    pub strategy: DiscoveryStrategy,
    pub max_sources: usize,
    #[serde(default)]
    pub inference: ProviderOverride,
}

impl ResolvedJob {
    pub fn resolve(
        job_id: &str,
        request: &ResearchRequest,
        settings: &PipelineSettings,
        stored: Option<&JobSettings>,
    ) -> Result<Self, PipelineError> {
        let topic = request.topic.trim();
        if topic.is_empty() {
            return Err(PipelineError::empty_input("research topic is empty"));
        }

        let strategy = match &request.strategy {
            Some(strategy) => strategy.clone(),
            None => DiscoveryStrategy::from_name(
                &settings.pipeline.default_strategy,
                settings.pipeline.iterative_max_iterations,
            )?,
        };
        let max_sources = request
            .max_sources
            .or_else(|| stored.and_then(|s| s.max_sources))
            .unwrap_or(settings.pipeline.max_sources)
            .max(1);
        let inference = stored
            .map(|s| ProviderOverride {
                provider: s.inference_provider.clone(),
                model: s.inference_model.clone(),
            })
            .unwrap_or_default();

        Ok(Self {
            job_id: job_id.to_string(),
            topic: topic.to_string(),
            include_leads: request.include_leads,
            strategy,
            max_sources,
            inference,
        })
    }

    /// Layer retry options over the resolved job. Retry overrides win over
    /// stored per-job choices.
    pub fn with_retry_options(mut self, options: &RetryOptions) -> Self {
        if options.skip_discovery {
            self.strategy = DiscoveryStrategy::ReusePrevious;
        }
        self.inference = options.inference_override().or(&self.inference);
        self
    }
}

/// A named phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchConfig,
    Discover,
    Analyze,
    GenerateActions,
    GenerateLeads,
    Finalize,
}

impl Stage {
    pub fn step_name(&self) -> &'static str {
        match self {
            Stage::FetchConfig => FETCH_CONFIG_STEP,
            Stage::Discover => DISCOVER_STEP,
            Stage::Analyze => ANALYZE_STEP,
            Stage::GenerateActions => GENERATE_ACTIONS_STEP,
            Stage::GenerateLeads => GENERATE_LEADS_STEP,
            Stage::Finalize => FINALIZE_STEP,
        }
    }

    /// Progress reached once the stage completes.
    pub fn milestone(&self) -> u8 {
        match self {
            Stage::FetchConfig => milestones::FETCH_CONFIG,
            Stage::Discover => milestones::DISCOVER,
            Stage::Analyze => milestones::ANALYZE,
            Stage::GenerateActions => milestones::GENERATE_ACTIONS,
            Stage::GenerateLeads => milestones::GENERATE_LEADS,
            Stage::Finalize => milestones::FINALIZE,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.step_name())
    }
}

/// The ordered stages of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    stages: Vec<Stage>,
}

impl PipelineDefinition {
    pub fn for_job(job: &ResolvedJob) -> Self {
        let mut stages = vec![
            Stage::FetchConfig,
            Stage::Discover,
            Stage::Analyze,
            Stage::GenerateActions,
        ];
        if job.include_leads {
            stages.push(Stage::GenerateLeads);
        }
        stages.push(Stage::Finalize);
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}
