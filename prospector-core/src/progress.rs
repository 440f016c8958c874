//! Monotonic run progress.

use crate::error::StoreError;
use crate::store::RunStore;
use std::sync::Arc;
use tracing::trace;

/// Progress milestones reached when each stage completes.
pub mod milestones {
    pub const FETCH_CONFIG: u8 = 5;
    pub const DISCOVER: u8 = 40;
    pub const ANALYZE: u8 = 60;
    pub const GENERATE_ACTIONS: u8 = 80;
    pub const GENERATE_LEADS: u8 = 90;
    pub const FINALIZE: u8 = 100;
}

/// The progress rule: never backwards, never past 100.
pub fn clamp_progress(current: u8, value: u8) -> u8 {
    value.min(100).max(current)
}

/// Progress reported after `attempts` poll checks.
pub fn poll_window(baseline: u8, increment: u8, ceiling: u8, attempts: u32) -> u8 {
    let raw = u64::from(baseline) + u64::from(attempts) * u64::from(increment);
    raw.min(u64::from(ceiling)).min(100) as u8
}

/// Pushes run progress forward through the store's atomic clamp.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn RunStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Advance to `value` and return the stored progress, which may be
    /// higher than `value` if another path already reported more.
    pub async fn advance(&self, run_id: &str, value: u8) -> Result<u8, StoreError> {
        let stored = self.store.advance_progress(run_id, value).await?;
        trace!(run_id, requested = value, stored, "Progress advanced");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewRun, SqliteStore};
    use serde_json::json;

    #[test]
    fn test_clamp_progress() {
        assert_eq!(clamp_progress(0, 5), 5);
        assert_eq!(clamp_progress(40, 10), 40);
        assert_eq!(clamp_progress(40, 250), 100);
        assert_eq!(clamp_progress(100, 0), 100);
    }

    #[test]
    fn test_poll_window_caps_at_ceiling() {
        assert_eq!(poll_window(10, 1, 38, 0), 10);
        assert_eq!(poll_window(10, 1, 38, 5), 15);
        assert_eq!(poll_window(10, 1, 38, 500), 38);
        assert_eq!(poll_window(10, 200, 255, 3), 100);
    }

    #[tokio::test]
    async fn test_tracker_never_regresses() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .create_run(NewRun {
                id: "r1".into(),
                job_id: "job".into(),
                payload: json!({}),
                retry_options: json!({}),
            })
            .await
            .unwrap();
        let tracker = ProgressTracker::new(store.clone());
        assert_eq!(tracker.advance("r1", 40).await.unwrap(), 40);
        assert_eq!(tracker.advance("r1", 12).await.unwrap(), 40);
        assert_eq!(tracker.advance("r1", 60).await.unwrap(), 60);
        assert_eq!(store.get_run("r1").await.unwrap().unwrap().progress, 60);
    }
}
