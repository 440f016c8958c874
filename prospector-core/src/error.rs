//! Error types for Prospector.
//!
//! `PipelineError` is what stages, providers and the orchestrator raise.
//! `classify` maps any of them onto the transient/fatal split that decides
//! whether a step is retried in place or the run is aborted.

use crate::providers::Capability;
use thiserror::Error;

/// Errors raised while executing a research run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Provider '{provider}' returned an error{}: {message}", status_suffix(.status))]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Request to '{provider}' failed: {message}")]
    Transport {
        provider: String,
        message: String,
        timed_out: bool,
    },

    #[error("Rate limited by '{provider}', retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("Malformed response from '{provider}': {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("No {capability} provider available: {reason}")]
    NoProviderAvailable {
        capability: Capability,
        reason: String,
    },

    /// Displays only the message; it becomes the run's visible error.
    #[error("{message}")]
    EmptyInput { message: String },

    #[error("Remote job did not finish after {attempts} checks ({waited_secs}s); resume later")]
    PollTimeoutExceeded { attempts: u32, waited_secs: u64 },

    #[error("Remote job failed: {message}")]
    RemoteJobFailed { message: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Job '{job_id}' already has an active run: {run_id}")]
    AlreadyRunning { job_id: String, run_id: String },

    #[error("Run '{run_id}' has already completed")]
    AlreadyCompleted { run_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl PipelineError {
    pub fn empty_input(message: impl Into<String>) -> Self {
        Self::EmptyInput {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Map a transport-level `reqwest` failure for the named provider.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::malformed(provider, err.to_string());
        }
        Self::Transport {
            provider: provider.to_string(),
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }

    /// Map a non-success HTTP status and its body.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::configuration(format!(
                "'{provider}' rejected the credential (HTTP {status})"
            )),
            429 => Self::RateLimited {
                provider: provider.to_string(),
                retry_after_secs: parse_retry_after(body).unwrap_or(5),
            },
            _ => Self::Provider {
                provider: provider.to_string(),
                status: Some(status),
                message: truncate(body, 300),
            },
        }
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Errors from the persistent record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Job '{job_id}' already has an active run: {run_id}")]
    ActiveRunExists { job_id: String, run_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is held by driver {owner}")]
    RunLeased { run_id: String, owner: String },

    #[error("Invalid stored value in column '{column}': {value}")]
    InvalidValue { column: String, value: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry in place with backoff.
    Transient,
    /// Abort the step and the run.
    Fatal(FatalKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Configuration,
    Input,
    Timeout,
    Cancelled,
    Irrecoverable,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "too many requests",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "connection reset",
    "connection refused",
    "econnreset",
    "overloaded",
    "try again",
];

/// Classify an error from its observable signal (status code, variant, message).
pub fn classify(err: &PipelineError) -> ErrorClass {
    match err {
        PipelineError::RateLimited { .. } => ErrorClass::Transient,
        PipelineError::Transport { .. } => ErrorClass::Transient,
        PipelineError::Provider {
            status: Some(status),
            message,
            ..
        } => {
            if is_transient_status(*status) || matches_transient_pattern(message) {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal(FatalKind::Irrecoverable)
            }
        }
        PipelineError::Provider { message, .. } => {
            if matches_transient_pattern(message) {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal(FatalKind::Irrecoverable)
            }
        }
        PipelineError::Configuration { .. } | PipelineError::NoProviderAvailable { .. } => {
            ErrorClass::Fatal(FatalKind::Configuration)
        }
        PipelineError::EmptyInput { .. } => ErrorClass::Fatal(FatalKind::Input),
        PipelineError::PollTimeoutExceeded { .. } => ErrorClass::Fatal(FatalKind::Timeout),
        PipelineError::Cancelled => ErrorClass::Fatal(FatalKind::Cancelled),
        PipelineError::RemoteJobFailed { message } if matches_transient_pattern(message) => {
            ErrorClass::Transient
        }
        PipelineError::MalformedResponse { .. }
        | PipelineError::RemoteJobFailed { .. }
        | PipelineError::AlreadyRunning { .. }
        | PipelineError::AlreadyCompleted { .. }
        | PipelineError::RunNotFound { .. }
        | PipelineError::Store(_)
        | PipelineError::Serialization(_)
        | PipelineError::Task(_) => ErrorClass::Fatal(FatalKind::Irrecoverable),
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

fn matches_transient_pattern(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

fn parse_retry_after(body: &str) -> Option<u64> {
    let lower = body.to_lowercase();
    let idx = lower.find("retry after")?;
    lower[idx + "retry after".len()..]
        .trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|n| n.parse().ok())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_err(status: Option<u16>, message: &str) -> PipelineError {
        PipelineError::Provider {
            provider: "exa".into(),
            status,
            message: message.into(),
        }
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert_eq!(classify(&provider_err(Some(500), "boom")), ErrorClass::Transient);
        assert_eq!(classify(&provider_err(Some(503), "")), ErrorClass::Transient);
        assert_eq!(classify(&provider_err(Some(408), "")), ErrorClass::Transient);
    }

    #[test]
    fn test_client_errors_are_fatal() {
        assert_eq!(
            classify(&provider_err(Some(400), "bad request")),
            ErrorClass::Fatal(FatalKind::Irrecoverable)
        );
        assert_eq!(
            classify(&provider_err(Some(404), "not found")),
            ErrorClass::Fatal(FatalKind::Irrecoverable)
        );
    }

    #[test]
    fn test_message_patterns_are_transient() {
        assert!(classify(&provider_err(None, "Rate limit exceeded")).is_transient());
        assert!(classify(&provider_err(None, "upstream timed out")).is_transient());
        assert!(classify(&provider_err(Some(400), "model overloaded, try again")).is_transient());
    }

    #[test]
    fn test_transport_and_rate_limit_are_transient() {
        let err = PipelineError::Transport {
            provider: "openai".into(),
            message: "connection closed".into(),
            timed_out: false,
        };
        assert!(classify(&err).is_transient());
        let err = PipelineError::RateLimited {
            provider: "openai".into(),
            retry_after_secs: 3,
        };
        assert!(classify(&err).is_transient());
        assert_eq!(err.retry_after_secs(), Some(3));
    }

    #[test]
    fn test_fatal_kinds() {
        assert_eq!(
            classify(&PipelineError::configuration("missing key")),
            ErrorClass::Fatal(FatalKind::Configuration)
        );
        assert_eq!(
            classify(&PipelineError::empty_input("no sources found")),
            ErrorClass::Fatal(FatalKind::Input)
        );
        assert_eq!(
            classify(&PipelineError::PollTimeoutExceeded {
                attempts: 3,
                waited_secs: 3
            }),
            ErrorClass::Fatal(FatalKind::Timeout)
        );
        assert_eq!(
            classify(&PipelineError::Cancelled),
            ErrorClass::Fatal(FatalKind::Cancelled)
        );
        assert_eq!(
            classify(&PipelineError::malformed("anthropic", "not json")),
            ErrorClass::Fatal(FatalKind::Irrecoverable)
        );
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            PipelineError::from_status("tavily", 401, "unauthorized"),
            PipelineError::Configuration { .. }
        ));
        let err = PipelineError::from_status("tavily", 429, "Please retry after 12 seconds");
        assert_eq!(err.retry_after_secs(), Some(12));
        let err = PipelineError::from_status("tavily", 429, "slow down");
        assert_eq!(err.retry_after_secs(), Some(5));
        assert!(matches!(
            PipelineError::from_status("tavily", 502, "bad gateway"),
            PipelineError::Provider {
                status: Some(502),
                ..
            }
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            PipelineError::empty_input("no sources found").to_string(),
            "no sources found"
        );
        assert_eq!(
            provider_err(Some(500), "boom").to_string(),
            "Provider 'exa' returned an error (HTTP 500): boom"
        );
        assert_eq!(
            provider_err(None, "boom").to_string(),
            "Provider 'exa' returned an error: boom"
        );
        assert_eq!(
            PipelineError::AlreadyRunning {
                job_id: "job-1".into(),
                run_id: "r1".into()
            }
            .to_string(),
            "Job 'job-1' already has an active run: r1"
        );
    }

    #[test]
    fn test_truncate_long_bodies() {
        let body = "x".repeat(500);
        match PipelineError::from_status("exa", 400, &body) {
            PipelineError::Provider { message, .. } => assert_eq!(message.len(), 303),
            other => panic!("unexpected {other:?}"),
        }
    }
}
