//! Cooperative run cancellation.
//!
//! A run is cancelled either through its in-process token or by another
//! process writing `CANCELLED` to the store. Both are checked at every
//! suspension point and between stages; in-flight provider calls are never
//! interrupted.

use crate::error::PipelineError;
use crate::store::{RunStatus, RunStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Clone)]
pub struct RunCancellation {
    run_id: String,
    token: CancellationToken,
    store: Option<Arc<dyn RunStore>>,
}

impl RunCancellation {
    pub fn new(run_id: impl Into<String>, token: CancellationToken, store: Arc<dyn RunStore>) -> Self {
        Self {
            run_id: run_id.into(),
            token,
            store: Some(store),
        }
    }

    /// A flag backed only by the token.
    pub fn detached(token: CancellationToken) -> Self {
        Self {
            run_id: String::new(),
            token,
            store: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the run has been cancelled here or elsewhere. A cancellation
    /// seen in the store is propagated to the token.
    pub async fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        let Some(store) = &self.store else {
            return false;
        };
        match store.get_run(&self.run_id).await {
            Ok(Some(run)) if run.status == RunStatus::Cancelled => {
                self.token.cancel();
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Could not read run status for cancellation");
                false
            }
        }
    }

    /// `Err(Cancelled)` if the run has been cancelled.
    pub async fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled().await {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Err(Cancelled)` if the token fires.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), PipelineError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
