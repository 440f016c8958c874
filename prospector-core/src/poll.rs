//! Polling of long-running remote jobs.
//!
//! The loop sleeps between checks on the tokio timer, so a run waiting on a
//! multi-minute agent job holds no worker thread.

use crate::cancel::RunCancellation;
use crate::config::PollConfig;
use crate::error::{PipelineError, classify};
use crate::progress::{ProgressTracker, poll_window};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What one check observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Pending,
    Done(T),
    Failed(String),
}

/// How the remote job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalStatus<T> {
    Done(T),
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&PollConfig> for PollOptions {
    fn from(config: &PollConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Progress reported while polling: `min(baseline + attempts * increment, ceiling)`.
#[derive(Debug, Clone, Copy)]
pub struct ProgressWindow {
    pub baseline: u8,
    pub increment: u8,
    pub ceiling: u8,
}

impl From<&PollConfig> for ProgressWindow {
    fn from(config: &PollConfig) -> Self {
        Self {
            baseline: config.baseline,
            increment: config.increment,
            ceiling: config.ceiling,
        }
    }
}

struct ProgressReporter {
    tracker: ProgressTracker,
    run_id: String,
    window: ProgressWindow,
}

pub struct PollLoop {
    cancel: RunCancellation,
    progress: Option<ProgressReporter>,
}

impl PollLoop {
    pub fn new(cancel: RunCancellation) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(
        mut self,
        tracker: ProgressTracker,
        run_id: impl Into<String>,
        window: ProgressWindow,
    ) -> Self {
        self.progress = Some(ProgressReporter {
            tracker,
            run_id: run_id.into(),
            window,
        });
        self
    }

    /// Sleep, check, repeat until `check` reports a terminal state.
    ///
    /// Fails with `PollTimeoutExceeded` after `max_attempts` non-terminal
    /// checks and with `Cancelled` as soon as a wake observes cancellation.
    /// Transient check errors consume an attempt; fatal ones propagate.
    pub async fn poll_until_terminal<T, F, Fut>(
        &self,
        mut check: F,
        options: PollOptions,
    ) -> Result<TerminalStatus<T>, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollState<T>, PipelineError>>,
    {
        let started = Instant::now();
        let max_attempts = options.max_attempts.max(1);
        self.report(0).await;

        for attempt in 1..=max_attempts {
            self.cancel.sleep(options.interval).await?;
            self.cancel.check().await?;

            match check().await {
                Ok(PollState::Done(value)) => {
                    debug!(attempt, "Remote job completed");
                    return Ok(TerminalStatus::Done(value));
                }
                Ok(PollState::Failed(message)) => {
                    debug!(attempt, message = %message, "Remote job failed");
                    return Ok(TerminalStatus::Failed(message));
                }
                Ok(PollState::Pending) => {
                    debug!(attempt, max_attempts, "Remote job still running");
                }
                Err(e) if classify(&e).is_transient() => {
                    warn!(attempt, error = %e, "Status check failed, will check again");
                }
                Err(e) => return Err(e),
            }
            self.report(attempt).await;
        }

        Err(PipelineError::PollTimeoutExceeded {
            attempts: max_attempts,
            waited_secs: started.elapsed().as_secs(),
        })
    }

    async fn report(&self, attempts: u32) {
        let Some(reporter) = &self.progress else {
            return;
        };
        let w = reporter.window;
        let value = poll_window(w.baseline, w.increment, w.ceiling, attempts);
        if let Err(e) = reporter.tracker.advance(&reporter.run_id, value).await {
            warn!(run_id = %reporter.run_id, error = %e, "Failed to report poll progress");
        }
    }
}
