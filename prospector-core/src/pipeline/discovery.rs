//! Source discovery strategies.
//!
//! Every strategy ends in the `discover` step, which fails with
//! "no sources found" when the run has nothing to analyze.

use super::context::StageContext;
use super::definition::{AGENT_START_STEP, DISCOVER_STEP, DiscoveryStrategy, iteration_step};
use super::stages::build_corpus;
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::poll::{PollLoop, PollOptions, PollState, ProgressWindow, TerminalStatus};
use crate::providers::{AgentJobState, ExtractionProvider, SearchHit};
use crate::store::NewSource;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;

/// Cached result of the `discover` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub strategy: String,
    pub source_count: usize,
    /// Narrative returned by an autonomous agent, if any.
    #[serde(default)]
    pub agent_summary: Option<String>,
}

/// Cached result of one `discover-iteration-N` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub iteration: u32,
    pub queries: Vec<String>,
    pub added: usize,
    /// Follow-up queries for the next iteration; empty ends the loop.
    pub next_queries: Vec<String>,
}

/// Cached result of `discover-agent-start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJobRef {
    pub provider: String,
    pub job_id: String,
}

const MAX_FOLLOW_UP_QUERIES: usize = 3;

/// Run the job's discovery strategy.
pub async fn discover(ctx: &StageContext) -> Result<DiscoveryOutcome, PipelineError> {
    match ctx.job.strategy.clone() {
        DiscoveryStrategy::Standard => standard(ctx).await,
        DiscoveryStrategy::IterativeLoop { max_iterations } => {
            iterative(ctx, max_iterations.max(1)).await
        }
        DiscoveryStrategy::AutonomousAgent => autonomous(ctx).await,
        DiscoveryStrategy::ReusePrevious => reuse_previous(ctx).await,
    }
}

async fn standard(ctx: &StageContext) -> Result<DiscoveryOutcome, PipelineError> {
    let settings = ctx.settings()?;
    let s = &settings;
    ctx.executor(s)
        .execute(&ctx.run_id, DISCOVER_STEP, || async move {
            let search = ctx.search(s)?;
            let extractor = ctx.extractor(s)?;
            let hits = search.search(&ctx.job.topic, ctx.job.max_sources).await?;
            debug!(run_id = %ctx.run_id, hits = hits.len(), provider = search.name(), "Search finished");
            ingest(ctx, extractor.as_ref(), search.name(), hits).await?;
            finish(ctx, &DiscoveryStrategy::Standard, None).await
        })
        .await
}

async fn iterative(ctx: &StageContext, max_iterations: u32) -> Result<DiscoveryOutcome, PipelineError> {
    let mut queries = vec![ctx.job.topic.clone()];

    for iteration in 1..=max_iterations {
        ctx.cancel.check().await?;
        let settings = ctx.settings()?;
        let s = &settings;
        let q = &queries;
        let last = iteration == max_iterations;

        let outcome: IterationOutcome = ctx
            .executor(s)
            .execute(&ctx.run_id, &iteration_step(iteration), || async move {
                let search = ctx.search(s)?;
                let extractor = ctx.extractor(s)?;
                let per_query = (ctx.job.max_sources / q.len().max(1)).max(1);
                let mut hits = Vec::new();
                for query in q {
                    hits.extend(search.search(query, per_query).await?);
                }
                let added = ingest(ctx, extractor.as_ref(), search.name(), hits).await?;

                let next_queries = if last {
                    Vec::new()
                } else {
                    follow_up_queries(ctx, s).await?
                };
                Ok(IterationOutcome {
                    iteration,
                    queries: q.clone(),
                    added,
                    next_queries,
                })
            })
            .await?;

        let window = ProgressWindow::from(&settings.poll);
        ctx.progress
            .advance(&ctx.run_id, loop_progress(window, iteration, max_iterations))
            .await?;
        info!(
            run_id = %ctx.run_id,
            iteration,
            added = outcome.added,
            follow_ups = outcome.next_queries.len(),
            "Discovery iteration finished"
        );

        if outcome.next_queries.is_empty() {
            break;
        }
        queries = outcome.next_queries;
    }

    let strategy = DiscoveryStrategy::IterativeLoop { max_iterations };
    let settings = ctx.settings()?;
    let strategy = &strategy;
    ctx.executor(&settings)
        .execute(&ctx.run_id, DISCOVER_STEP, || finish(ctx, strategy, None))
        .await
}

async fn follow_up_queries(
    ctx: &StageContext,
    settings: &PipelineSettings,
) -> Result<Vec<String>, PipelineError> {
    let sources = ctx.store.list_sources(&ctx.run_id).await?;
    if sources.is_empty() {
        return Ok(Vec::new());
    }
    let corpus = build_corpus(&sources, settings.pipeline.source_excerpt_chars);
    let model = ctx.model(settings)?;
    let gaps = model.identify_gaps(&ctx.job.topic, &corpus).await?;
    if !gaps.has_gaps {
        return Ok(Vec::new());
    }
    let mut seen = HashSet::new();
    Ok(gaps
        .suggested_queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.to_lowercase()))
        .take(MAX_FOLLOW_UP_QUERIES)
        .collect())
}

async fn autonomous(ctx: &StageContext) -> Result<DiscoveryOutcome, PipelineError> {
    let settings = ctx.settings()?;
    let s = &settings;

    // One paid job per run: the job id is checkpointed before polling.
    let job: AgentJobRef = ctx
        .executor(s)
        .execute(&ctx.run_id, AGENT_START_STEP, || async move {
            let agent = ctx.agent(s)?;
            let job_id = agent.start_job(&ctx.job.topic, ctx.job.max_sources).await?;
            info!(run_id = %ctx.run_id, provider = agent.name(), job_id = %job_id, "Agent job started");
            Ok(AgentJobRef {
                provider: agent.name().to_string(),
                job_id,
            })
        })
        .await?;

    let job = &job;
    ctx.executor(s)
        .execute(&ctx.run_id, DISCOVER_STEP, || async move {
            let agent = ctx.agent(s)?;
            let poller = PollLoop::new(ctx.cancel.clone()).with_progress(
                ctx.progress.clone(),
                ctx.run_id.clone(),
                ProgressWindow::from(&s.poll),
            );
            let status = poller
                .poll_until_terminal(
                    || {
                        let agent = agent.clone();
                        async move {
                            Ok(match agent.job_status(&job.job_id).await? {
                                AgentJobState::Running => PollState::Pending,
                                AgentJobState::Completed { sources, analysis } => {
                                    PollState::Done((sources, analysis))
                                }
                                AgentJobState::Failed { message } => PollState::Failed(message),
                            })
                        }
                    },
                    PollOptions::from(&s.poll),
                )
                .await?;

            let (hits, analysis) = match status {
                TerminalStatus::Done(done) => done,
                TerminalStatus::Failed(message) => {
                    return Err(PipelineError::RemoteJobFailed { message });
                }
            };
            let sources = dedup_hits(hits)
                .into_iter()
                .map(|(url, hit)| NewSource {
                    content: if hit.snippet.trim().is_empty() {
                        hit.title.clone()
                    } else {
                        hit.snippet
                    },
                    url,
                    title: hit.title,
                    provider: job.provider.clone(),
                })
                .filter(|source| !source.content.trim().is_empty())
                .collect();
            let added = ctx.store.insert_sources(&ctx.run_id, sources).await?;
            debug!(run_id = %ctx.run_id, added, "Agent sources stored");
            finish(ctx, &DiscoveryStrategy::AutonomousAgent, analysis).await
        })
        .await
}

async fn reuse_previous(ctx: &StageContext) -> Result<DiscoveryOutcome, PipelineError> {
    let settings = ctx.settings()?;
    ctx.executor(&settings)
        .execute(&ctx.run_id, DISCOVER_STEP, || async move {
            let existing = ctx.store.count_sources(&ctx.run_id).await?;
            if existing == 0 {
                if let Some(previous) = ctx
                    .store
                    .latest_run_with_sources(&ctx.job.job_id, &ctx.run_id)
                    .await?
                {
                    let copied = ctx.store.copy_sources(&previous, &ctx.run_id).await?;
                    info!(run_id = %ctx.run_id, from = %previous, copied, "Reusing sources of previous run");
                }
            } else {
                info!(run_id = %ctx.run_id, existing, "Reusing sources of this run");
            }
            finish(ctx, &DiscoveryStrategy::ReusePrevious, None).await
        })
        .await
}

/// Extract the hits and persist every page with content. A hit whose page
/// could not be extracted keeps its search snippet. Returns the number of
/// new sources.
async fn ingest(
    ctx: &StageContext,
    extractor: &dyn ExtractionProvider,
    search_provider: &str,
    hits: Vec<SearchHit>,
) -> Result<usize, PipelineError> {
    let hits = dedup_hits(hits);
    if hits.is_empty() {
        return Ok(0);
    }
    let urls: Vec<String> = hits.iter().map(|(url, _)| url.clone()).collect();
    let pages = extractor.extract_multiple(&urls).await;

    let sources: Vec<NewSource> = hits
        .into_iter()
        .zip(pages)
        .filter_map(|((url, hit), page)| {
            if page.success {
                Some(NewSource {
                    url,
                    title: if page.title.trim().is_empty() {
                        hit.title
                    } else {
                        page.title
                    },
                    content: page.content,
                    provider: extractor.name().to_string(),
                })
            } else if !hit.snippet.trim().is_empty() {
                Some(NewSource {
                    url,
                    title: hit.title,
                    content: hit.snippet,
                    provider: search_provider.to_string(),
                })
            } else {
                None
            }
        })
        .collect();

    let added = ctx.store.insert_sources(&ctx.run_id, sources).await?;
    debug!(run_id = %ctx.run_id, added, "Sources stored");
    Ok(added)
}

async fn finish(
    ctx: &StageContext,
    strategy: &DiscoveryStrategy,
    agent_summary: Option<String>,
) -> Result<DiscoveryOutcome, PipelineError> {
    let source_count = ctx.store.count_sources(&ctx.run_id).await?;
    if source_count == 0 {
        return Err(PipelineError::empty_input("no sources found"));
    }
    info!(run_id = %ctx.run_id, strategy = %strategy, source_count, "Discovery finished");
    Ok(DiscoveryOutcome {
        strategy: strategy.to_string(),
        source_count,
        agent_summary,
    })
}

/// Canonical form of a source URL: http(s) only, fragment removed.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Drop hits with unusable or repeated URLs, keeping first occurrences.
fn dedup_hits(hits: Vec<SearchHit>) -> Vec<(String, SearchHit)> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter_map(|hit| normalize_url(&hit.url).map(|url| (url, hit)))
        .filter(|(url, _)| seen.insert(url.clone()))
        .collect()
}

fn loop_progress(window: ProgressWindow, iteration: u32, max_iterations: u32) -> u8 {
    let span = u32::from(window.ceiling.saturating_sub(window.baseline));
    let value = u32::from(window.baseline) + span * iteration.min(max_iterations) / max_iterations.max(1);
    value.min(100) as u8
}
