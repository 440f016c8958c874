//! Persistent record store.
//!
//! The store is the only shared mutable resource of the orchestrator. Every
//! write is scoped to one run id (or, for aggregates, one job id) and relies
//! on row-level atomic upserts, so concurrent runs need no cross-run locking.

pub mod sqlite;
pub mod types;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub use sqlite::SqliteStore;
pub use types::{
    ActionItem, Insight, JobSettings, LeadRecord, LeadSummary, NewAction, NewInsight, NewLead,
    NewRun, NewSource, RunSnapshot, RunStatus, SourceItem, StepRecord, StepStatus, WorkflowRun,
};

#[async_trait]
pub trait RunStore: Send + Sync {
    // --- runs ---

    /// Create a run in `PENDING`. Fails with `ActiveRunExists` if the job
    /// already has a non-terminal run.
    async fn create_run(&self, run: NewRun) -> Result<WorkflowRun, StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    async fn active_run_for_job(&self, job_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    /// Most recent first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>, StoreError>;

    async fn list_runs_with_status(&self, status: RunStatus)
    -> Result<Vec<WorkflowRun>, StoreError>;

    /// Set status and error. Terminal statuses stamp `completed_at`; moving
    /// back to an active status clears it and the error.
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Take over a run for `owner` and mark it `IN_PROGRESS`.
    ///
    /// Fails with `RunLeased` while a different owner's heartbeat is younger
    /// than `lease`, and with `ActiveRunExists` when another run of the job
    /// is active.
    async fn claim_run(
        &self,
        run_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<WorkflowRun, StoreError>;

    /// Refresh the heartbeat of a claimed run. `false` once `owner` no
    /// longer holds it.
    async fn renew_lease(&self, run_id: &str, owner: &str) -> Result<bool, StoreError>;

    /// Record the outcome of a drive and drop the claim. A run held by
    /// someone else is returned untouched; a run that is already terminal
    /// keeps its status.
    async fn release_run(
        &self,
        run_id: &str,
        owner: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Replace the stored retry options (used when a failed run is retried).
    async fn set_retry_options(&self, run_id: &str, retry_options: Value)
    -> Result<(), StoreError>;

    async fn set_current_step(&self, run_id: &str, step: &str) -> Result<(), StoreError>;

    async fn set_run_summary(&self, run_id: &str, summary: &str) -> Result<(), StoreError>;

    /// Atomically set progress to `clamp(value, current, 100)` and return it.
    async fn advance_progress(&self, run_id: &str, value: u8) -> Result<u8, StoreError>;

    // --- steps ---

    async fn get_step(&self, run_id: &str, name: &str) -> Result<Option<StepRecord>, StoreError>;

    /// In creation order.
    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError>;

    /// Mark a step `RUNNING` and increment its attempt count, creating it if
    /// needed. A `DONE` step is returned unchanged.
    async fn begin_step(&self, run_id: &str, name: &str) -> Result<StepRecord, StoreError>;

    /// Persist the result and mark `DONE`, returning the stored record. A step
    /// already `DONE` keeps its original result.
    async fn complete_step(
        &self,
        run_id: &str,
        name: &str,
        result: Value,
    ) -> Result<StepRecord, StoreError>;

    async fn fail_step(&self, run_id: &str, name: &str, error: &str) -> Result<(), StoreError>;

    // --- outputs ---

    /// Insert sources, skipping URLs already present for the run. Returns the
    /// number of new rows.
    async fn insert_sources(&self, run_id: &str, sources: Vec<NewSource>)
    -> Result<usize, StoreError>;

    async fn list_sources(&self, run_id: &str) -> Result<Vec<SourceItem>, StoreError>;

    async fn count_sources(&self, run_id: &str) -> Result<usize, StoreError>;

    /// Latest other run of `job_id` that has persisted sources.
    async fn latest_run_with_sources(
        &self,
        job_id: &str,
        exclude_run_id: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Copy sources between runs with the same URL dedup as `insert_sources`.
    async fn copy_sources(&self, from_run_id: &str, to_run_id: &str) -> Result<usize, StoreError>;

    /// Insert insights, skipping titles already present for the run.
    async fn insert_insights(&self, run_id: &str, insights: Vec<NewInsight>)
    -> Result<usize, StoreError>;

    async fn list_insights(&self, run_id: &str) -> Result<Vec<Insight>, StoreError>;

    /// Insert action items, skipping titles already present for the run.
    async fn insert_actions(&self, run_id: &str, actions: Vec<NewAction>)
    -> Result<usize, StoreError>;

    async fn list_actions(&self, run_id: &str) -> Result<Vec<ActionItem>, StoreError>;

    /// Insert leads, skipping companies already present for the run.
    async fn insert_leads(
        &self,
        run_id: &str,
        job_id: &str,
        leads: Vec<NewLead>,
    ) -> Result<usize, StoreError>;

    async fn list_leads(&self, run_id: &str) -> Result<Vec<LeadRecord>, StoreError>;

    /// Upsert the job's lead summary. The generation counter increments once
    /// per distinct run; the lead total is recounted.
    async fn upsert_lead_summary(&self, job_id: &str, run_id: &str)
    -> Result<LeadSummary, StoreError>;

    async fn get_lead_summary(&self, job_id: &str) -> Result<Option<LeadSummary>, StoreError>;

    // --- job settings ---

    async fn get_job_settings(&self, job_id: &str) -> Result<Option<JobSettings>, StoreError>;

    async fn put_job_settings(&self, settings: JobSettings) -> Result<(), StoreError>;
}
