//! Provider fallback resolution.
//!
//! Walks an ordered candidate list and returns the first client that can be
//! constructed. Only construction failures (missing credential, bad base URL,
//! unknown provider) trigger fallback here; failures of the calls themselves
//! are classified and retried by the step executor.

use super::Capability;
use crate::config::{CapabilityConfig, ProviderConfig};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Caller-supplied provider/model choice (e.g. from retry options).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderOverride {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.model.is_none()
    }

    /// Merge this override over `other`; fields set here win.
    pub fn or(&self, other: &ProviderOverride) -> ProviderOverride {
        ProviderOverride {
            provider: self.provider.clone().or_else(|| other.provider.clone()),
            model: self.model.clone().or_else(|| other.model.clone()),
        }
    }

    /// Ordered candidates with the override placed first.
    ///
    /// A provider override reuses the matching configured candidate when one
    /// exists; otherwise a fresh candidate reading `<PROVIDER>_API_KEY` is
    /// created. A model-only override applies to the primary.
    pub fn candidates(&self, config: &CapabilityConfig) -> Vec<ProviderConfig> {
        let configured: Vec<ProviderConfig> = config
            .primary
            .iter()
            .chain(config.secondary.iter())
            .cloned()
            .collect();

        let Some(provider) = self.provider.as_deref() else {
            let mut out = configured;
            if let (Some(model), Some(first)) = (self.model.as_ref(), out.first_mut()) {
                first.model = Some(model.clone());
            }
            return out;
        };

        let mut preferred = configured
            .iter()
            .find(|c| c.provider == provider)
            .cloned()
            .unwrap_or_else(|| ProviderConfig {
                provider: provider.to_string(),
                api_key_env: Some(format!(
                    "{}_API_KEY",
                    provider.to_uppercase().replace('-', "_")
                )),
                ..ProviderConfig::default()
            });
        if let Some(model) = &self.model {
            preferred.model = Some(model.clone());
        }

        let mut out = vec![preferred];
        out.extend(configured.into_iter().filter(|c| c.provider != provider));
        out
    }
}

/// A constructed client and the candidate it came from.
pub struct Resolved<C: ?Sized> {
    pub client: Arc<C>,
    pub config: ProviderConfig,
    /// Whether an earlier candidate was skipped.
    pub fell_back: bool,
}

impl<C: ?Sized> std::fmt::Debug for Resolved<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("provider", &self.config.provider)
            .field("model", &self.config.model)
            .field("fell_back", &self.fell_back)
            .finish()
    }
}

/// Provider-agnostic resolver; `build` knows how to instantiate a client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderResolver;

impl ProviderResolver {
    /// Resolve from a primary and an optional secondary candidate.
    pub fn resolve<C, F>(
        &self,
        capability: Capability,
        primary: Option<&ProviderConfig>,
        secondary: Option<&ProviderConfig>,
        build: F,
    ) -> Result<Resolved<C>, PipelineError>
    where
        C: ?Sized,
        F: Fn(&ProviderConfig, Option<String>) -> Result<Arc<C>, PipelineError>,
    {
        let candidates: Vec<ProviderConfig> =
            primary.into_iter().chain(secondary).cloned().collect();
        self.resolve_candidates(capability, &candidates, build)
    }

    /// Resolve from an ordered candidate list.
    pub fn resolve_candidates<C, F>(
        &self,
        capability: Capability,
        candidates: &[ProviderConfig],
        build: F,
    ) -> Result<Resolved<C>, PipelineError>
    where
        C: ?Sized,
        F: Fn(&ProviderConfig, Option<String>) -> Result<Arc<C>, PipelineError>,
    {
        let mut skipped = Vec::new();

        for candidate in candidates {
            let credential = candidate.credential();
            if candidate.requires_credential() && credential.is_none() {
                debug!(
                    capability = %capability,
                    provider = %candidate.provider,
                    "Skipping provider without credential"
                );
                skipped.push(format!("{}: no credential", candidate.provider));
                continue;
            }

            match build(candidate, credential) {
                Ok(client) => {
                    let fell_back = !skipped.is_empty();
                    if fell_back {
                        info!(
                            capability = %capability,
                            provider = %candidate.provider,
                            "Using fallback provider"
                        );
                    }
                    return Ok(Resolved {
                        client,
                        config: candidate.clone(),
                        fell_back,
                    });
                }
                Err(e) => {
                    warn!(
                        capability = %capability,
                        provider = %candidate.provider,
                        error = %e,
                        "Skipping provider that failed to initialize"
                    );
                    skipped.push(format!("{}: {}", candidate.provider, e));
                }
            }
        }

        let reason = if skipped.is_empty() {
            "no candidates configured".to_string()
        } else {
            skipped.join("; ")
        };
        Err(PipelineError::NoProviderAvailable { capability, reason })
    }
}
