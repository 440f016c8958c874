//! Prospector CLI: trigger, observe and operate research runs.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Prospector: durable research pipelines from topic to leads
#[derive(Parser, Debug)]
#[command(name = "prospector", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Trigger a research run and wait for it to finish
    Run {
        /// Research topic
        topic: String,
        /// Job the run belongs to
        #[arg(short, long, default_value = "default")]
        job: String,
        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,
        /// Also generate sales leads
        #[arg(long)]
        include_leads: bool,
        /// Discovery strategy: standard, iterative, agent, reuse
        #[arg(short, long)]
        strategy: Option<String>,
        /// Iterations for the iterative strategy
        #[arg(long)]
        iterations: Option<u32>,
        /// Maximum sources to collect
        #[arg(long)]
        max_sources: Option<usize>,
    },
    /// Retry a failed or cancelled run from its last checkpoint
    Retry {
        run_id: String,
        /// Reuse the sources of a previous run instead of discovering again
        #[arg(long)]
        skip_discovery: bool,
        /// Inference provider to use for the remaining steps
        #[arg(long)]
        provider: Option<String>,
        /// Inference model to use for the remaining steps
        #[arg(long)]
        model: Option<String>,
    },
    /// Show a run and its steps
    Status {
        run_id: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Follow a run until it reaches a terminal status
    Watch {
        run_id: String,
        /// Seconds between refreshes
        #[arg(short, long, default_value = "5")]
        interval: u64,
    },
    /// List recent runs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a run
    Cancel { run_id: String },
    /// Resume runs left unfinished by a previous process
    Recover,
    /// Manage per-job settings
    JobSettings {
        #[command(subcommand)]
        action: JobSettingsAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum JobSettingsAction {
    /// Show the settings of a job
    Get { job_id: String },
    /// Store settings for a job
    Set {
        job_id: String,
        /// Preferred inference provider
        #[arg(long)]
        provider: Option<String>,
        /// Preferred inference model
        #[arg(long)]
        model: Option<String>,
        /// Maximum sources per run
        #[arg(long)]
        max_sources: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "prospector", "prospector")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "prospector.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "prospector",
            "-vv",
            "run",
            "solar installers",
            "--job",
            "job-7",
            "--include-leads",
            "--strategy",
            "iterative",
            "--iterations",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                topic,
                job,
                include_leads,
                strategy,
                iterations,
                run_id,
                max_sources,
            } => {
                assert_eq!(topic, "solar installers");
                assert_eq!(job, "job-7");
                assert!(include_leads);
                assert_eq!(strategy.as_deref(), Some("iterative"));
                assert_eq!(iterations, Some(2));
                assert!(run_id.is_none());
                assert!(max_sources.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_retry_with_override() {
        let cli = Cli::try_parse_from([
            "prospector",
            "retry",
            "run-1",
            "--skip-discovery",
            "--provider",
            "anthropic",
        ])
        .unwrap();
        match cli.command {
            Commands::Retry {
                run_id,
                skip_discovery,
                provider,
                model,
            } => {
                assert_eq!(run_id, "run-1");
                assert!(skip_discovery);
                assert_eq!(provider.as_deref(), Some("anthropic"));
                assert!(model.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_job_settings_set() {
        let cli = Cli::try_parse_from([
            "prospector",
            "job-settings",
            "set",
            "job-1",
            "--max-sources",
            "25",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::JobSettings {
                action: JobSettingsAction::Set {
                    max_sources: Some(25),
                    ..
                }
            }
        ));
    }

    #[test]
    fn test_run_requires_topic() {
        assert!(Cli::try_parse_from(["prospector", "run"]).is_err());
    }
}
