//! Records persisted for each run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(RunStatus::Pending),
            "IN_PROGRESS" => Some(RunStatus::InProgress),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the research pipeline for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub job_id: String,
    pub status: RunStatus,
    /// 0-100, never decreases.
    pub progress: u8,
    pub error: Option<String>,
    pub current_step: Option<String>,
    pub summary: Option<String>,
    /// Trigger payload as received.
    pub payload: Value,
    pub retry_options: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Driver currently holding the run, if any.
    pub owner: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Fields needed to create a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub job_id: String,
    pub payload: Value,
    pub retry_options: Value,
}

/// Status of a checkpointed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    NotStarted,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "NOT_STARTED",
            StepStatus::Running => "RUNNING",
            StepStatus::Done => "DONE",
            StepStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NOT_STARTED" => Some(StepStatus::NotStarted),
            "RUNNING" => Some(StepStatus::Running),
            "DONE" => Some(StepStatus::Done),
            "FAILED" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpoint of one named unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub name: String,
    pub status: StepStatus,
    /// Total invocations across all executions of the run.
    pub attempts: u32,
    /// Cached result; immutable once `status` is `Done`.
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Creation order within the run.
    pub seq: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A discovered source, unique by URL within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: i64,
    pub run_id: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub url: String,
    pub title: String,
    pub content: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: i64,
    pub run_id: String,
    pub title: String,
    pub detail: String,
    pub category: Option<String>,
    pub source_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInsight {
    pub title: String,
    pub detail: String,
    pub category: Option<String>,
    pub source_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: i64,
    pub run_id: String,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub title: String,
    pub description: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: i64,
    pub run_id: String,
    pub job_id: String,
    pub company: String,
    pub contact_role: Option<String>,
    pub website: Option<String>,
    pub rationale: String,
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub company: String,
    pub contact_role: Option<String>,
    pub website: Option<String>,
    pub rationale: String,
    pub score: Option<f64>,
}

/// Aggregate over every lead generated for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSummary {
    pub job_id: String,
    pub total_leads: u64,
    /// Number of distinct runs that generated leads.
    pub generation_count: u32,
    pub last_run_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-job defaults maintained outside the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub job_id: String,
    pub inference_provider: Option<String>,
    pub inference_model: Option<String>,
    pub max_sources: Option<usize>,
}

/// Everything an observer sees about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    pub steps: Vec<StepRecord>,
}
