//! The research pipeline.
//!
//! `fetch-config → discover → analyze → generate-actions → [generate-leads] → finalize`,
//! each stage checkpointed as a step so an interrupted or failed run resumes
//! after its last completed step.

pub mod context;
pub mod definition;
pub mod discovery;
pub mod orchestrator;
pub mod stages;

pub use context::StageContext;
pub use definition::{
    DiscoveryStrategy, PipelineDefinition, ResearchRequest, ResolvedJob, RetryOptions, Stage,
    Trigger, iteration_step,
};
pub use discovery::{DiscoveryOutcome, normalize_url};
pub use orchestrator::{Orchestrator, RunHandle};
pub use stages::{ActionsOutcome, AnalysisOutcome, FinalReport, LeadsOutcome};
