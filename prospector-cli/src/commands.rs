//! CLI subcommand handlers.

use crate::Commands;
use crate::JobSettingsAction;
use prospector_core::providers::HttpProviderCatalog;
use prospector_core::store::JobSettings;
use prospector_core::{
    ConfigSource, DiscoveryStrategy, LayeredConfigSource, Orchestrator, ResearchRequest,
    RetryOptions, RunSnapshot, RunStatus, RunStore, SqliteStore, Trigger, WorkflowRun,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything a command needs to talk to the run store.
struct Runtime {
    orchestrator: Orchestrator,
    store: Arc<SqliteStore>,
    iterative_max_iterations: u32,
}

impl Runtime {
    fn open(workspace: &Path, config: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut source = LayeredConfigSource::new(Some(workspace.to_path_buf()), None);
        if let Some(file) = config {
            source = source.with_file(file);
        }
        let settings = source
            .current()
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

        let path = if settings.store.path.is_absolute() {
            settings.store.path.clone()
        } else {
            workspace.join(&settings.store.path)
        };
        let store = Arc::new(SqliteStore::open(&path)?);
        tracing::debug!(path = %path.display(), "Using run store");

        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(source),
            Arc::new(HttpProviderCatalog),
        );
        Ok(Self {
            orchestrator,
            store,
            iterative_max_iterations: settings.pipeline.iterative_max_iterations,
        })
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let rt = Runtime::open(workspace, config)?;
    match command {
        Commands::Run {
            topic,
            job,
            run_id,
            include_leads,
            strategy,
            iterations,
            max_sources,
        } => {
            let strategy = strategy
                .map(|name| {
                    DiscoveryStrategy::from_name(
                        &name,
                        iterations.unwrap_or(rt.iterative_max_iterations),
                    )
                })
                .transpose()?;
            let mut payload = ResearchRequest::new(topic);
            payload.include_leads = include_leads;
            payload.strategy = strategy;
            payload.max_sources = max_sources;
            let trigger = Trigger {
                run_id: run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                job_id: job,
                payload,
                retry_options: None,
            };
            drive(&rt, trigger).await
        }
        Commands::Retry {
            run_id,
            skip_discovery,
            provider,
            model,
        } => {
            let run = rt
                .store
                .get_run(&run_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Run '{}' not found", run_id))?;
            let payload: ResearchRequest = serde_json::from_value(run.payload.clone())?;
            let trigger = Trigger {
                run_id: run.id,
                job_id: run.job_id,
                payload,
                retry_options: Some(RetryOptions {
                    skip_discovery,
                    inference_provider: provider,
                    inference_model: model,
                }),
            };
            drive(&rt, trigger).await
        }
        Commands::Status { run_id, json } => {
            let snapshot = rt.orchestrator.status(&run_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&rt, &snapshot).await?;
            }
            Ok(())
        }
        Commands::Watch { run_id, interval } => watch(&rt, &run_id, interval).await,
        Commands::List { limit } => {
            let runs = rt.orchestrator.list_runs(limit).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            println!(
                "{:<38} {:<16} {:<12} {:>8}  Created",
                "Run", "Job", "Status", "Progress"
            );
            for run in runs {
                println!(
                    "{:<38} {:<16} {:<12} {:>7}%  {}",
                    run.id,
                    run.job_id,
                    run.status,
                    run.progress,
                    local_time(run.created_at)
                );
            }
            Ok(())
        }
        Commands::Cancel { run_id } => {
            let run = rt.orchestrator.cancel(&run_id).await?;
            println!("Run {} is {}", run.id, run.status);
            Ok(())
        }
        Commands::Recover => {
            let handles = rt.orchestrator.recover_interrupted().await?;
            if handles.is_empty() {
                println!("No interrupted runs.");
                return Ok(());
            }
            println!("Resuming {} run(s)...", handles.len());
            for handle in handles {
                let run = handle.wait().await?;
                print_outcome(&run);
            }
            Ok(())
        }
        Commands::JobSettings { action } => handle_job_settings(&rt, action).await,
    }
}

/// Start a run and wait for it. Ctrl-C cancels the run at its next
/// checkpoint instead of abandoning it mid-step.
async fn drive(rt: &Runtime, trigger: Trigger) -> anyhow::Result<()> {
    let handle = rt.orchestrator.start(trigger).await?;
    let run_id = handle.run_id().to_string();
    println!("Run {} started", run_id);

    let wait = handle.wait();
    tokio::pin!(wait);
    let run = tokio::select! {
        run = &mut wait => run?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling run {}...", run_id);
            rt.orchestrator.cancel(&run_id).await?;
            wait.await?
        }
    };
    print_outcome(&run);
    if run.status == RunStatus::Failed {
        anyhow::bail!("run {} failed", run.id);
    }
    Ok(())
}

async fn watch(rt: &Runtime, run_id: &str, interval: u64) -> anyhow::Result<()> {
    let mut last: Option<(RunStatus, u8, Option<String>)> = None;
    loop {
        let snapshot = rt.orchestrator.status(run_id).await?;
        let run = &snapshot.run;
        let current = (run.status, run.progress, run.current_step.clone());
        if last.as_ref() != Some(&current) {
            println!(
                "{} {:>3}% {} {}",
                local_time(chrono::Utc::now()),
                run.progress,
                run.status,
                run.current_step.as_deref().unwrap_or("-")
            );
            last = Some(current);
        }
        if run.status.is_terminal() {
            print_outcome(run);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }
}

async fn handle_job_settings(rt: &Runtime, action: JobSettingsAction) -> anyhow::Result<()> {
    match action {
        JobSettingsAction::Get { job_id } => {
            match rt.store.get_job_settings(&job_id).await? {
                Some(settings) => println!("{}", serde_json::to_string_pretty(&settings)?),
                None => println!("No settings stored for job '{}'", job_id),
            }
            Ok(())
        }
        JobSettingsAction::Set {
            job_id,
            provider,
            model,
            max_sources,
        } => {
            let mut settings = rt
                .store
                .get_job_settings(&job_id)
                .await?
                .unwrap_or_else(|| JobSettings {
                    job_id: job_id.clone(),
                    ..JobSettings::default()
                });
            if provider.is_some() {
                settings.inference_provider = provider;
            }
            if model.is_some() {
                settings.inference_model = model;
            }
            if max_sources.is_some() {
                settings.max_sources = max_sources;
            }
            rt.store.put_job_settings(settings.clone()).await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn print_snapshot(rt: &Runtime, snapshot: &RunSnapshot) -> anyhow::Result<()> {
    let run = &snapshot.run;
    println!("Run:      {}", run.id);
    println!("Job:      {}", run.job_id);
    println!("Status:   {} ({}%)", run.status, run.progress);
    if let Some(step) = &run.current_step {
        println!("Step:     {}", step);
    }
    if let Some(owner) = &run.owner {
        println!("Driver:   {}", owner);
    }
    println!("Created:  {}", local_time(run.created_at));
    if let Some(done) = run.completed_at {
        println!("Finished: {}", local_time(done));
    }
    if let Some(error) = &run.error {
        println!("Error:    {}", error);
    }

    println!("\nSteps:");
    for step in &snapshot.steps {
        let error = step
            .error
            .as_deref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        println!(
            "  {:<24} {:<12} attempts: {}{}",
            step.name, step.status, step.attempts, error
        );
    }

    let sources = rt.store.count_sources(&run.id).await?;
    let insights = rt.store.list_insights(&run.id).await?.len();
    let actions = rt.store.list_actions(&run.id).await?.len();
    let leads = rt.store.list_leads(&run.id).await?.len();
    println!(
        "\nOutputs:  {} sources, {} insights, {} action items, {} leads",
        sources, insights, actions, leads
    );
    if let Some(summary) = &run.summary {
        println!("\n{}", summary);
    }
    Ok(())
}

fn print_outcome(run: &WorkflowRun) {
    match run.status {
        RunStatus::Completed => {
            println!("Run {} completed", run.id);
            if let Some(summary) = &run.summary {
                println!("{}", summary);
            }
        }
        RunStatus::Failed => {
            eprintln!(
                "Run {} failed at {}% ({}): {}",
                run.id,
                run.progress,
                run.current_step.as_deref().unwrap_or("-"),
                run.error.as_deref().unwrap_or("unknown error")
            );
            eprintln!("  Retry with: prospector retry {}", run.id);
        }
        status => println!("Run {} is {}", run.id, status),
    }
}

fn local_time(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_runtime_opens_store_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::open(dir.path(), None).unwrap();
        assert!(dir.path().join(".prospector").join("prospector.db").exists());
        assert!(rt.orchestrator.list_runs(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_settings_set_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::open(dir.path(), None).unwrap();

        handle_job_settings(
            &rt,
            JobSettingsAction::Set {
                job_id: "job-1".into(),
                provider: Some("anthropic".into()),
                model: None,
                max_sources: None,
            },
        )
        .await
        .unwrap();
        handle_job_settings(
            &rt,
            JobSettingsAction::Set {
                job_id: "job-1".into(),
                provider: None,
                model: None,
                max_sources: Some(12),
            },
        )
        .await
        .unwrap();

        let stored = rt.store.get_job_settings("job-1").await.unwrap().unwrap();
        assert_eq!(
            stored,
            JobSettings {
                job_id: "job-1".into(),
                inference_provider: Some("anthropic".into()),
                inference_model: None,
                max_sources: Some(12),
            }
        );
    }

    #[test]
    fn test_explicit_config_file_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "[store]\npath = \"data/runs.db\"\n").unwrap();
        Runtime::open(dir.path(), Some(file)).unwrap();
        assert!(dir.path().join("data").join("runs.db").exists());
    }
}
