//! # Prospector Core
//!
//! Durable research-pipeline orchestrator. A run turns a research topic into
//! sources, insights, action items and sales leads through a fixed sequence
//! of checkpointed steps, falling back between interchangeable providers and
//! surviving restarts without repeating completed work.

pub mod cancel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod poll;
pub mod progress;
pub mod providers;
pub mod retry;
pub mod step;
pub mod store;

// Re-export commonly used types at the crate root.
pub use cancel::RunCancellation;
pub use config::{ConfigSource, LayeredConfigSource, PipelineSettings, StaticConfigSource};
pub use error::{ConfigError, ErrorClass, FatalKind, PipelineError, StoreError, classify};
pub use pipeline::{
    DiscoveryStrategy, Orchestrator, ResearchRequest, RetryOptions, RunHandle, Trigger,
};
pub use poll::{PollLoop, PollOptions, PollState, TerminalStatus};
pub use progress::ProgressTracker;
pub use retry::RetryPolicy;
pub use step::StepExecutor;
pub use store::{RunSnapshot, RunStatus, RunStore, SqliteStore, StepStatus, WorkflowRun};
