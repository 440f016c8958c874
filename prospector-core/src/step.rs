//! Checkpointed step execution.
//!
//! A step whose record is `DONE` is never run again: its persisted result is
//! returned instead. Completing the step record is the last thing a
//! successful step does, so anything the work function wrote before a crash
//! is redone on replay and must be idempotent.

use crate::cancel::RunCancellation;
use crate::error::{ErrorClass, PipelineError, classify};
use crate::retry::RetryPolicy;
use crate::store::{RunStore, StepRecord, StepStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn RunStore>,
    policy: RetryPolicy,
    cancel: RunCancellation,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn RunStore>, policy: RetryPolicy, cancel: RunCancellation) -> Self {
        Self {
            store,
            policy,
            cancel,
        }
    }

    /// Run `work` as step `step` of `run_id`, or replay its cached result.
    ///
    /// Transient failures are retried up to the policy's attempt ceiling with
    /// backoff; anything else marks the step `FAILED` and is returned.
    pub async fn execute<T, F, Fut>(
        &self,
        run_id: &str,
        step: &str,
        mut work: F,
    ) -> Result<T, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        if let Some(record) = self.store.get_step(run_id, step).await? {
            if record.status == StepStatus::Done {
                debug!(run_id, step, "Replaying completed step");
                return cached_result(record);
            }
        }

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let record = self.store.begin_step(run_id, step).await?;
            if record.status == StepStatus::Done {
                return cached_result(record);
            }
            self.store.set_current_step(run_id, step).await?;
            debug!(run_id, step, attempt, total_attempts = record.attempts, "Running step");

            let err = match work().await {
                Ok(value) => {
                    let payload = serde_json::to_value(&value)?;
                    let stored = self.store.complete_step(run_id, step, payload).await?;
                    info!(run_id, step, attempt, "Step completed");
                    // Another driver may have completed the step first.
                    return cached_result(stored);
                }
                Err(e) => e,
            };

            match classify(&err) {
                ErrorClass::Transient if attempt < max_attempts => {
                    let delay = self.policy.delay(attempt, err.retry_after_secs());
                    warn!(
                        run_id,
                        step,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient step failure, retrying"
                    );
                    if let Err(cancelled) = self.cancel.sleep(delay).await {
                        self.store
                            .fail_step(run_id, step, &cancelled.to_string())
                            .await?;
                        return Err(cancelled);
                    }
                }
                class => {
                    warn!(run_id, step, attempt, class = ?class, error = %err, "Step failed");
                    self.store.fail_step(run_id, step, &err.to_string()).await?;
                    return Err(err);
                }
            }
        }
    }
}

fn cached_result<T: DeserializeOwned>(record: StepRecord) -> Result<T, PipelineError> {
    Ok(serde_json::from_value(record.result.unwrap_or(Value::Null))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::providers::mock::transient_error;
    use crate::store::{NewRun, SqliteStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    async fn setup(max_attempts: u32) -> (Arc<SqliteStore>, StepExecutor, CancellationToken) {
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
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        });
        let token = CancellationToken::new();
        let executor = StepExecutor::new(
            store.clone(),
            policy,
            RunCancellation::new("r1", token.clone(), store.clone()),
        );
        (store, executor, token)
    }

    #[tokio::test]
    async fn test_done_step_is_replayed_from_cache() {
        let (store, executor, _) = setup(3).await;
        let calls = AtomicU32::new(0);
        let work = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(vec!["a".to_string(), "b".to_string()]) }
        };

        let first: Vec<String> = executor.execute("r1", "discover", work).await.unwrap();
        let second: Vec<String> = executor.execute("r1", "discover", work).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = store.get_step("r1", "discover").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Done);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_result_completed_elsewhere_wins() {
        let (store, executor, _) = setup(3).await;
        let value: String = executor
            .execute("r1", "analyze", || {
                let store = store.clone();
                async move {
                    store
                        .complete_step("r1", "analyze", json!("first"))
                        .await
                        .unwrap();
                    Ok("second".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "first");
        let record = store.get_step("r1", "analyze").await.unwrap().unwrap();
        assert_eq!(record.result, Some(json!("first")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_is_bounded() {
        let (store, executor, _) = setup(3).await;
        let calls = AtomicU32::new(0);
        let err = executor
            .execute::<(), _, _>("r1", "analyze", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient_error()) }
            })
            .await
            .unwrap_err();

        assert!(classify(&err).is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let record = store.get_step("r1", "analyze").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.error.unwrap().contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let (store, executor, _) = setup(5).await;
        let calls = AtomicU32::new(0);
        let err = executor
            .execute::<(), _, _>("r1", "discover", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::empty_input("no sources found")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "no sources found");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = store.get_step("r1", "discover").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let (store, executor, _) = setup(3).await;
        let calls = AtomicU32::new(0);
        let value: u32 = executor
            .execute("r1", "analyze", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(transient_error())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        let record = store.get_step("r1", "analyze").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Done);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.result, Some(json!(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_gets_fresh_budget_on_rerun() {
        let (store, executor, _) = setup(2).await;
        let calls = AtomicU32::new(0);
        let work = || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient_error())
                } else {
                    Ok("done".to_string())
                }
            }
        };
        assert!(executor.execute::<String, _, _>("r1", "s", work).await.is_err());
        let value: String = executor.execute("r1", "s", work).await.unwrap();
        assert_eq!(value, "done");
        assert_eq!(store.get_step("r1", "s").await.unwrap().unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (store, executor, token) = setup(3).await;
        token.cancel();
        let err = executor
            .execute::<(), _, _>("r1", "analyze", || async { Err(transient_error()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        let record = store.get_step("r1", "analyze").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempts, 1);
    }
}
