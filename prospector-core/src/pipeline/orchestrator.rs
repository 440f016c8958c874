//! Run lifecycle: admission, the stage walk, and terminal bookkeeping.
//!
//! One tokio task drives each run. Runs share nothing but the store, so any
//! number of them can be in flight at once.
//!
//! A driver claims its run in the store under a lease and keeps it alive
//! with a heartbeat. Another orchestrator, in this process or another one,
//! only takes a non-terminal run over once that heartbeat has gone stale.

use super::context::StageContext;
use super::definition::{PipelineDefinition, ResearchRequest, RetryOptions, Stage, Trigger};
use super::discovery;
use super::stages::{self, StageOutputs};
use crate::cancel::RunCancellation;
use crate::config::ConfigSource;
use crate::error::{PipelineError, StoreError, classify};
use crate::progress::ProgressTracker;
use crate::providers::ProviderCatalog;
use crate::retry::RetryPolicy;
use crate::step::StepExecutor;
use crate::store::{NewRun, RunSnapshot, RunStatus, RunStore, WorkflowRun};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// A run being driven in the background.
pub struct RunHandle {
    run_id: String,
    task: JoinHandle<Result<WorkflowRun, PipelineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<WorkflowRun, PipelineError> {
        self.task.await?
    }
}

struct Inner {
    store: Arc<dyn RunStore>,
    config: Arc<dyn ConfigSource>,
    catalog: Arc<dyn ProviderCatalog>,
    /// Lease owner id written to the runs this orchestrator drives.
    owner: String,
    /// Runs driven by this orchestrator.
    active: Mutex<HashMap<String, ActiveRun>>,
    generations: AtomicU64,
}

struct ActiveRun {
    generation: u64,
    token: CancellationToken,
}

/// What `admit` hands to the driving task.
struct Admission {
    run: WorkflowRun,
    token: CancellationToken,
    generation: u64,
    lease: Duration,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        config: Arc<dyn ConfigSource>,
        catalog: Arc<dyn ProviderCatalog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                catalog,
                owner: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple()),
                active: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.inner.store.clone()
    }

    /// Lease owner id of this orchestrator.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Admit a trigger and drive the run on its own task.
    ///
    /// - an unknown run id creates a run, unless the job already has an
    ///   active one (`AlreadyRunning`);
    /// - a `FAILED` or `CANCELLED` run is reopened and retried from its
    ///   checkpoints, with the trigger's retry options;
    /// - a `PENDING` or `IN_PROGRESS` run whose lease has expired was
    ///   interrupted and is resumed;
    /// - a run still driven here, or leased by a live driver elsewhere, is
    ///   rejected with `AlreadyRunning`;
    /// - a `COMPLETED` run is rejected with `AlreadyCompleted`.
    pub async fn start(&self, trigger: Trigger) -> Result<RunHandle, PipelineError> {
        let admission = self.admit(trigger).await?;
        let run_id = admission.run.id.clone();
        let span = info_span!("run", run_id = %admission.run.id, job_id = %admission.run.job_id);
        let this = self.clone();
        let task = tokio::spawn(async move { this.drive(admission).await }.instrument(span));
        Ok(RunHandle { run_id, task })
    }

    /// Admit a trigger and wait for the run to finish. A run that fails
    /// still returns `Ok` with status `FAILED`; `Err` means it never started.
    pub async fn execute(&self, trigger: Trigger) -> Result<WorkflowRun, PipelineError> {
        self.start(trigger).await?.wait().await
    }

    /// Request cancellation. The run stops at its next checkpoint; an
    /// in-flight provider call is allowed to finish.
    pub async fn cancel(&self, run_id: &str) -> Result<WorkflowRun, PipelineError> {
        let store = &self.inner.store;
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let run = store
            .update_run_status(run_id, RunStatus::Cancelled, None)
            .await?;
        if let Some(entry) = self.inner.active.lock().await.get(run_id) {
            entry.token.cancel();
        }
        info!(run_id, "Run cancelled");
        Ok(run)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunSnapshot, PipelineError> {
        let store = &self.inner.store;
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let steps = store.list_steps(run_id).await?;
        Ok(RunSnapshot { run, steps })
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>, PipelineError> {
        Ok(self.inner.store.list_runs(limit).await?)
    }

    /// Resume every non-terminal run left behind by a previous process.
    /// Runs whose driver still holds a live lease are left alone.
    pub async fn recover_interrupted(&self) -> Result<Vec<RunHandle>, PipelineError> {
        let store = &self.inner.store;
        let mut runs = store.list_runs_with_status(RunStatus::InProgress).await?;
        runs.extend(store.list_runs_with_status(RunStatus::Pending).await?);

        let mut handles = Vec::new();
        for run in runs {
            if self.inner.active.lock().await.contains_key(&run.id) {
                continue;
            }
            let payload: ResearchRequest = match serde_json::from_value(run.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Skipping run with unreadable payload");
                    continue;
                }
            };
            let trigger = Trigger {
                run_id: run.id.clone(),
                job_id: run.job_id.clone(),
                payload,
                retry_options: None,
            };
            match self.start(trigger).await {
                Ok(handle) => {
                    info!(run_id = %run.id, "Recovered interrupted run");
                    handles.push(handle);
                }
                Err(PipelineError::AlreadyRunning { .. }) => {
                    debug!(run_id = %run.id, "Run is held by a live driver")
                }
                Err(e) => warn!(run_id = %run.id, error = %e, "Could not recover run"),
            }
        }
        Ok(handles)
    }

    async fn admit(&self, trigger: Trigger) -> Result<Admission, PipelineError> {
        let mut active = self.inner.active.lock().await;
        let store = &self.inner.store;
        let lease = Duration::from_secs(self.inner.config.current()?.pipeline.lease_secs);
        let retry_options = trigger
            .retry_options
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let (run, reopened) = match store.get_run(&trigger.run_id).await? {
            None => {
                let run = store
                    .create_run(NewRun {
                        id: trigger.run_id.clone(),
                        job_id: trigger.job_id.clone(),
                        payload: serde_json::to_value(&trigger.payload)?,
                        retry_options: retry_options.clone().unwrap_or_else(|| json!({})),
                    })
                    .await
                    .map_err(|e| already_running(e, &trigger.job_id))?;
                info!(run_id = %run.id, job_id = %run.job_id, "Run created");
                (run, None)
            }
            // Until the previous task here has finished, whatever the stored status.
            Some(run) if active.contains_key(&run.id) => {
                return Err(PipelineError::AlreadyRunning {
                    job_id: run.job_id,
                    run_id: run.id,
                });
            }
            Some(run) if run.status == RunStatus::Completed => {
                return Err(PipelineError::AlreadyCompleted { run_id: run.id });
            }
            Some(run) => {
                let previous = run.status;
                (run, Some(previous))
            }
        };

        let mut run = store
            .claim_run(&run.id, &self.inner.owner, lease)
            .await
            .map_err(|e| already_running(e, &run.job_id))?;
        match reopened {
            None => {}
            Some(RunStatus::Pending | RunStatus::InProgress) => {
                info!(run_id = %run.id, progress = run.progress, "Resuming interrupted run");
            }
            Some(previous) => {
                info!(run_id = %run.id, previous = %previous, "Retrying run from its checkpoints");
            }
        }
        if let Some(options) = retry_options.filter(|_| reopened.is_some()) {
            store.set_retry_options(&run.id, options.clone()).await?;
            run.retry_options = options;
        }

        let token = CancellationToken::new();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        active.insert(
            run.id.clone(),
            ActiveRun {
                generation,
                token: token.clone(),
            },
        );
        Ok(Admission {
            run,
            token,
            generation,
            lease,
        })
    }

    async fn drive(self, admission: Admission) -> Result<WorkflowRun, PipelineError> {
        let Admission {
            run,
            token,
            generation,
            lease,
        } = admission;
        let heartbeat = tokio::spawn(
            self.clone()
                .heartbeat(run.id.clone(), token.clone(), lease)
                .in_current_span(),
        );
        let cancel = RunCancellation::new(run.id.clone(), token, self.inner.store.clone());
        let outcome = self.walk(&run, &cancel).await;
        heartbeat.abort();
        let finished = self.finish(&run.id, outcome).await;

        let mut active = self.inner.active.lock().await;
        if active
            .get(&run.id)
            .is_some_and(|entry| entry.generation == generation)
        {
            active.remove(&run.id);
        }
        finished
    }

    /// Renew the lease until aborted. Losing it cancels the run locally so
    /// the new holder is left to drive it alone.
    async fn heartbeat(self, run_id: String, token: CancellationToken, lease: Duration) {
        let every = (lease / 3).max(Duration::from_millis(100));
        loop {
            tokio::time::sleep(every).await;
            match self
                .inner
                .store
                .renew_lease(&run_id, &self.inner.owner)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(run_id = %run_id, "Lost the lease on the run, stopping");
                    token.cancel();
                    return;
                }
                Err(e) => warn!(run_id = %run_id, error = %e, "Could not renew run lease"),
            }
        }
    }

    async fn walk(&self, run: &WorkflowRun, cancel: &RunCancellation) -> Result<(), PipelineError> {
        let store = self.inner.store.clone();
        let request: ResearchRequest = serde_json::from_value(run.payload.clone())?;
        let retry: RetryOptions = match &run.retry_options {
            Value::Null => RetryOptions::default(),
            value => serde_json::from_value(value.clone())?,
        };

        cancel.check().await?;
        let settings = self.inner.config.current()?;
        let executor = StepExecutor::new(
            store.clone(),
            RetryPolicy::new(&settings.retry),
            cancel.clone(),
        );
        let job = stages::fetch_config(
            &executor,
            store.as_ref(),
            &run.id,
            &run.job_id,
            &request,
            &settings,
        )
        .await?;
        ProgressTracker::new(store.clone())
            .advance(&run.id, Stage::FetchConfig.milestone())
            .await?;

        let job = job.with_retry_options(&retry);
        let definition = PipelineDefinition::for_job(&job);
        info!(
            strategy = %job.strategy,
            include_leads = job.include_leads,
            stages = definition.stages().len(),
            "Walking pipeline"
        );

        let ctx = StageContext::new(
            run.id.clone(),
            job,
            store,
            self.inner.config.clone(),
            self.inner.catalog.clone(),
            cancel.clone(),
        );
        let mut outputs = StageOutputs::default();
        for stage in definition.stages() {
            if *stage == Stage::FetchConfig {
                continue;
            }
            cancel.check().await?;
            match stage {
                Stage::FetchConfig => {}
                Stage::Discover => outputs.discovery = Some(discovery::discover(&ctx).await?),
                Stage::Analyze => outputs.analysis = Some(stages::analyze(&ctx).await?),
                Stage::GenerateActions => {
                    outputs.actions =
                        Some(stages::generate_actions(&ctx, outputs.analysis.as_ref()).await?)
                }
                Stage::GenerateLeads => {
                    outputs.leads =
                        Some(stages::generate_leads(&ctx, outputs.analysis.as_ref()).await?)
                }
                Stage::Finalize => outputs.report = Some(stages::finalize(&ctx, &outputs).await?),
            }
            let progress = ctx.progress.advance(&run.id, stage.milestone()).await?;
            info!(stage = %stage, progress, "Stage finished");
        }
        Ok(())
    }

    /// Record the terminal status and release the lease. A run cancelled
    /// while the walk was finishing stays `CANCELLED`; a run taken over by
    /// another driver is left to it.
    async fn finish(
        &self,
        run_id: &str,
        outcome: Result<(), PipelineError>,
    ) -> Result<WorkflowRun, PipelineError> {
        let store = &self.inner.store;
        let owner = self.inner.owner.as_str();
        let current = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if current.owner.as_deref() != Some(owner) {
            warn!(run_id, holder = ?current.owner, "Run was taken over by another driver");
            return Ok(current);
        }
        if current.status == RunStatus::Cancelled {
            info!(run_id, "Run stopped after cancellation");
            return Ok(store
                .release_run(run_id, owner, RunStatus::Cancelled, None)
                .await?);
        }

        let run = match outcome {
            Ok(()) => {
                store.advance_progress(run_id, 100).await?;
                let run = store
                    .release_run(run_id, owner, RunStatus::Completed, None)
                    .await?;
                info!(run_id, status = %run.status, "Run completed");
                run
            }
            Err(PipelineError::Cancelled) => {
                store
                    .release_run(run_id, owner, RunStatus::Cancelled, None)
                    .await?
            }
            Err(e) => {
                error!(run_id, class = ?classify(&e), error = %e, "Run failed");
                store
                    .release_run(run_id, owner, RunStatus::Failed, Some(e.to_string()))
                    .await?
            }
        };
        Ok(run)
    }
}

fn already_running(err: StoreError, job_id: &str) -> PipelineError {
    match err {
        StoreError::ActiveRunExists { job_id, run_id } => {
            PipelineError::AlreadyRunning { job_id, run_id }
        }
        StoreError::RunLeased { run_id, owner } => {
            debug!(run_id = %run_id, owner = %owner, "Run is leased by another driver");
            PipelineError::AlreadyRunning {
                job_id: job_id.to_string(),
                run_id,
            }
        }
        other => PipelineError::Store(other),
    }
}
