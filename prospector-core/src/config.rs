//! Configuration system for Prospector.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config dir (`config.toml`) and/or
//! `.prospector/config.toml` in the workspace directory.
//!
//! The orchestrator never caches configuration: every stage asks its
//! [`ConfigSource`] for the current settings.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub inference: CapabilityConfig,
    pub search: CapabilityConfig,
    pub extraction: CapabilityConfig,
    pub agent: CapabilityConfig,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            inference: CapabilityConfig {
                primary: Some(ProviderConfig::new("openai", Some("gpt-4o-mini"), "OPENAI_API_KEY")),
                secondary: Some(ProviderConfig::new(
                    "anthropic",
                    Some("claude-3-5-haiku-latest"),
                    "ANTHROPIC_API_KEY",
                )),
                request_timeout_secs: 120,
            },
            search: CapabilityConfig {
                primary: Some(ProviderConfig::new("exa", None, "EXA_API_KEY")),
                secondary: Some(ProviderConfig::new("tavily", None, "TAVILY_API_KEY")),
                request_timeout_secs: 30,
            },
            extraction: CapabilityConfig {
                primary: Some(ProviderConfig::new("firecrawl", None, "FIRECRAWL_API_KEY")),
                secondary: Some(ProviderConfig {
                    provider: "direct".to_string(),
                    ..ProviderConfig::default()
                }),
                request_timeout_secs: 30,
            },
            agent: CapabilityConfig {
                primary: Some(ProviderConfig::new("firecrawl", None, "FIRECRAWL_API_KEY")),
                secondary: None,
                request_timeout_secs: 30,
            },
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            pipeline: PipelineConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Ordered candidates for one capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<ProviderConfig>,
    /// Per-request timeout applied by the HTTP clients.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    60
}

/// One provider candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider kind ("openai", "anthropic", "exa", "tavily", "firecrawl", "direct", ...).
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Environment variable holding the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Inline credential. Takes precedence over `api_key_env`; never serialized.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider: &str, model: Option<&str>, api_key_env: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.map(str::to_string),
            api_key_env: Some(api_key_env.to_string()),
            api_key: None,
            base_url: None,
        }
    }

    /// Whether this candidate needs a credential at all.
    pub fn requires_credential(&self) -> bool {
        self.api_key.is_some() || self.api_key_env.is_some()
    }

    /// The configured credential, checking the inline key then the env var.
    pub fn credential(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Retry behaviour for transient step failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total invocations of a work function, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Polling of long-running remote jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
    /// Progress reported before the first check.
    pub baseline: u8,
    /// Progress added per consumed attempt.
    pub increment: u8,
    /// Progress never exceeds this value while polling.
    pub ceiling: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            max_attempts: 40,
            baseline: 10,
            increment: 1,
            ceiling: 38,
        }
    }
}

/// Pipeline shape defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_sources: usize,
    pub iterative_max_iterations: u32,
    /// Strategy used when a trigger does not name one.
    pub default_strategy: String,
    pub temperature: f32,
    /// Characters of each source fed into synthesis prompts.
    pub source_excerpt_chars: usize,
    /// Seconds a driver's claim on a run survives without a heartbeat.
    pub lease_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_sources: 10,
            iterative_max_iterations: 3,
            default_strategy: "standard".to_string(),
            temperature: 0.3,
            source_excerpt_chars: 4_000,
            lease_secs: 120,
        }
    }
}

/// Persistent store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".prospector/prospector.db"),
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PROSPECTOR_`)
/// 3. Workspace-local config (`.prospector/config.toml`)
/// 4. User config (`~/.config/prospector/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PipelineSettings>,
) -> Result<PipelineSettings, Box<figment::Error>> {
    load_config_with_file(workspace, None, overrides)
}

/// [`load_config`] with an explicit config file merged above the
/// workspace file.
pub fn load_config_with_file(
    workspace: Option<&Path>,
    file: Option<&Path>,
    overrides: Option<&PipelineSettings>,
) -> Result<PipelineSettings, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PipelineSettings::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "prospector", "prospector") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".prospector").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }

    // PROSPECTOR_RETRY__MAX_ATTEMPTS, PROSPECTOR_INFERENCE__PRIMARY__MODEL, ...
    figment = figment.merge(Env::prefixed("PROSPECTOR_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check the loaded settings for values the pipeline cannot run with.
pub fn validate(settings: &PipelineSettings) -> Result<(), ConfigError> {
    if settings.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid {
            message: "retry.max_attempts must be at least 1".into(),
        });
    }
    if settings.poll.max_attempts == 0 {
        return Err(ConfigError::Invalid {
            message: "poll.max_attempts must be at least 1".into(),
        });
    }
    if settings.poll.ceiling > 100 || settings.poll.baseline > settings.poll.ceiling {
        return Err(ConfigError::Invalid {
            message: "poll progress window must satisfy baseline <= ceiling <= 100".into(),
        });
    }
    if settings.pipeline.max_sources == 0 {
        return Err(ConfigError::Invalid {
            message: "pipeline.max_sources must be at least 1".into(),
        });
    }
    if settings.pipeline.lease_secs == 0 {
        return Err(ConfigError::Invalid {
            message: "pipeline.lease_secs must be at least 1".into(),
        });
    }
    Ok(())
}

/// Where stages read their configuration from.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> Result<PipelineSettings, ConfigError>;
}

/// Re-reads the figment stack on every call.
pub struct LayeredConfigSource {
    workspace: Option<PathBuf>,
    file: Option<PathBuf>,
    overrides: Option<PipelineSettings>,
}

impl LayeredConfigSource {
    pub fn new(workspace: Option<PathBuf>, overrides: Option<PipelineSettings>) -> Self {
        Self {
            workspace,
            file: None,
            overrides,
        }
    }

    pub fn with_file(mut self, file: PathBuf) -> Self {
        self.file = Some(file);
        self
    }
}

impl ConfigSource for LayeredConfigSource {
    fn current(&self) -> Result<PipelineSettings, ConfigError> {
        let settings = load_config_with_file(
            self.workspace.as_deref(),
            self.file.as_deref(),
            self.overrides.as_ref(),
        )?;
        validate(&settings)?;
        Ok(settings)
    }
}

/// Fixed settings, for embedding and tests.
pub struct StaticConfigSource(pub PipelineSettings);

impl ConfigSource for StaticConfigSource {
    fn current(&self) -> Result<PipelineSettings, ConfigError> {
        Ok(self.0.clone())
    }
}
