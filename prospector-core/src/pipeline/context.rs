//! Per-run state shared by the stages.

use super::definition::ResolvedJob;
use crate::cancel::RunCancellation;
use crate::config::{CapabilityConfig, ConfigSource, PipelineSettings};
use crate::error::PipelineError;
use crate::progress::ProgressTracker;
use crate::providers::{
    AgentProvider, Capability, ExtractionProvider, ProviderCatalog, ProviderResolver,
    ResearchModel, SearchProvider,
};
use crate::retry::RetryPolicy;
use crate::step::StepExecutor;
use crate::store::RunStore;
use std::sync::Arc;
use tracing::debug;

/// Everything a stage needs. Configuration is re-read through
/// [`StageContext::settings`] at the top of each stage, never cached here.
pub struct StageContext {
    pub run_id: String,
    pub job: ResolvedJob,
    pub store: Arc<dyn RunStore>,
    pub progress: ProgressTracker,
    pub cancel: RunCancellation,
    config: Arc<dyn ConfigSource>,
    catalog: Arc<dyn ProviderCatalog>,
    resolver: ProviderResolver,
}

impl StageContext {
    pub fn new(
        run_id: impl Into<String>,
        job: ResolvedJob,
        store: Arc<dyn RunStore>,
        config: Arc<dyn ConfigSource>,
        catalog: Arc<dyn ProviderCatalog>,
        cancel: RunCancellation,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            job,
            progress: ProgressTracker::new(store.clone()),
            store,
            cancel,
            config,
            catalog,
            resolver: ProviderResolver,
        }
    }

    /// The configuration as it is right now.
    pub fn settings(&self) -> Result<PipelineSettings, PipelineError> {
        Ok(self.config.current()?)
    }

    /// A step executor using the retry policy of `settings`.
    pub fn executor(&self, settings: &PipelineSettings) -> StepExecutor {
        StepExecutor::new(
            self.store.clone(),
            RetryPolicy::new(&settings.retry),
            self.cancel.clone(),
        )
    }

    pub fn search(&self, settings: &PipelineSettings) -> Result<Arc<dyn SearchProvider>, PipelineError> {
        let cap = &settings.search;
        let resolved = self.resolver.resolve(
            Capability::Search,
            cap.primary.as_ref(),
            cap.secondary.as_ref(),
            |config, credential| self.catalog.search(config, credential, cap.request_timeout_secs),
        )?;
        debug!(run_id = %self.run_id, provider = %resolved.config.provider, "Resolved search provider");
        Ok(resolved.client)
    }

    pub fn extractor(
        &self,
        settings: &PipelineSettings,
    ) -> Result<Arc<dyn ExtractionProvider>, PipelineError> {
        let cap = &settings.extraction;
        let resolved = self.resolver.resolve(
            Capability::Extraction,
            cap.primary.as_ref(),
            cap.secondary.as_ref(),
            |config, credential| {
                self.catalog
                    .extraction(config, credential, cap.request_timeout_secs)
            },
        )?;
        debug!(run_id = %self.run_id, provider = %resolved.config.provider, "Resolved extraction provider");
        Ok(resolved.client)
    }

    pub fn agent(&self, settings: &PipelineSettings) -> Result<Arc<dyn AgentProvider>, PipelineError> {
        let cap = &settings.agent;
        let resolved = self.resolver.resolve(
            Capability::Agent,
            cap.primary.as_ref(),
            cap.secondary.as_ref(),
            |config, credential| self.catalog.agent(config, credential, cap.request_timeout_secs),
        )?;
        debug!(run_id = %self.run_id, provider = %resolved.config.provider, "Resolved agent provider");
        Ok(resolved.client)
    }

    /// The inference model, honouring the job's provider/model override.
    pub fn model(&self, settings: &PipelineSettings) -> Result<ResearchModel, PipelineError> {
        let cap: &CapabilityConfig = &settings.inference;
        let candidates = self.job.inference.candidates(cap);
        let resolved = self.resolver.resolve_candidates(
            Capability::Inference,
            &candidates,
            |config, credential| {
                self.catalog
                    .inference(config, credential, cap.request_timeout_secs)
            },
        )?;
        debug!(
            run_id = %self.run_id,
            provider = %resolved.config.provider,
            model = ?resolved.config.model,
            "Resolved inference provider"
        );
        Ok(ResearchModel::new(
            resolved.client,
            settings.pipeline.temperature,
        ))
    }
}
