//! Configuration, synthesis and finalisation stages.
//!
//! Each stage runs inside one checkpointed step. Rows written by a stage are
//! deduplicated on their natural key, so a step that crashed after a partial
//! write can simply run again.

use super::context::StageContext;
use super::definition::{
    ANALYZE_STEP, FETCH_CONFIG_STEP, FINALIZE_STEP, GENERATE_ACTIONS_STEP, GENERATE_LEADS_STEP,
    ResearchRequest, ResolvedJob,
};
use super::discovery::DiscoveryOutcome;
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::step::StepExecutor;
use crate::store::{Insight, NewAction, NewInsight, NewLead, RunStore, SourceItem};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use tracing::info;

/// Cached result of `analyze`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub insight_count: usize,
    pub summary: String,
    pub trends: Vec<String>,
    pub provider: String,
}

/// Cached result of `generate-actions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionsOutcome {
    pub action_count: usize,
}

/// Cached result of `generate-leads`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadsOutcome {
    pub lead_count: usize,
    pub total_leads: u64,
    pub generation_count: u32,
}

/// Cached result of `finalize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub sources: usize,
    pub insights: usize,
    pub actions: usize,
    pub leads: usize,
    pub summary: String,
}

/// Results of the stages walked so far, in pipeline order.
#[derive(Debug, Default)]
pub struct StageOutputs {
    pub discovery: Option<DiscoveryOutcome>,
    pub analysis: Option<AnalysisOutcome>,
    pub actions: Option<ActionsOutcome>,
    pub leads: Option<LeadsOutcome>,
    pub report: Option<FinalReport>,
}

#[derive(Debug, Deserialize)]
struct ActionPlan {
    #[serde(default)]
    actions: Vec<ActionDraft>,
}

#[derive(Debug, Deserialize)]
struct ActionDraft {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LeadList {
    #[serde(default)]
    leads: Vec<LeadDraft>,
}

#[derive(Debug, Deserialize)]
struct LeadDraft {
    company: String,
    #[serde(default)]
    contact_role: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Resolve the job from the trigger payload, the current configuration and
/// the stored per-job settings.
pub async fn fetch_config(
    executor: &StepExecutor,
    store: &dyn RunStore,
    run_id: &str,
    job_id: &str,
    request: &ResearchRequest,
    settings: &PipelineSettings,
) -> Result<ResolvedJob, PipelineError> {
    executor
        .execute(run_id, FETCH_CONFIG_STEP, || async move {
            let stored = store.get_job_settings(job_id).await?;
            let job = ResolvedJob::resolve(job_id, request, settings, stored.as_ref())?;
            info!(run_id, strategy = %job.strategy, max_sources = job.max_sources, "Job resolved");
            Ok(job)
        })
        .await
}

/// Turn the run's sources into insights.
pub async fn analyze(ctx: &StageContext) -> Result<AnalysisOutcome, PipelineError> {
    let settings = ctx.settings()?;
    let s = &settings;
    ctx.executor(s)
        .execute(&ctx.run_id, ANALYZE_STEP, || async move {
            let sources = ctx.store.list_sources(&ctx.run_id).await?;
            if sources.is_empty() {
                return Err(PipelineError::empty_input("no sources found"));
            }
            let model = ctx.model(s)?;
            let corpus = build_corpus(&sources, s.pipeline.source_excerpt_chars);
            let analysis = model.analyze_content(&ctx.job.topic, &corpus).await?;

            let drafts: Vec<NewInsight> = analysis
                .insights
                .into_iter()
                .filter(|i| !i.title.trim().is_empty())
                .map(|i| NewInsight {
                    title: i.title.trim().to_string(),
                    detail: i.detail,
                    category: i.category,
                    source_urls: i.source_urls,
                })
                .collect();
            let added = ctx.store.insert_insights(&ctx.run_id, drafts).await?;
            let insight_count = ctx.store.list_insights(&ctx.run_id).await?.len();
            info!(run_id = %ctx.run_id, added, insight_count, "Analysis stored");

            Ok(AnalysisOutcome {
                insight_count,
                summary: analysis.summary,
                trends: analysis.trends,
                provider: model.provider_name().to_string(),
            })
        })
        .await
}

/// Propose action items from the insights.
pub async fn generate_actions(
    ctx: &StageContext,
    analysis: Option<&AnalysisOutcome>,
) -> Result<ActionsOutcome, PipelineError> {
    let settings = ctx.settings()?;
    let s = &settings;
    ctx.executor(s)
        .execute(&ctx.run_id, GENERATE_ACTIONS_STEP, || async move {
            let insights = ctx.store.list_insights(&ctx.run_id).await?;
            let model = ctx.model(s)?;
            let prompt = actions_prompt(&ctx.job.topic, analysis, &insights);
            let plan: ActionPlan = model.generate_json(&prompt).await?;

            let actions: Vec<NewAction> = plan
                .actions
                .into_iter()
                .filter(|a| !a.title.trim().is_empty())
                .map(|a| NewAction {
                    title: a.title.trim().to_string(),
                    description: a.description,
                    priority: normalize_priority(a.priority.as_deref()).to_string(),
                })
                .collect();
            let added = ctx.store.insert_actions(&ctx.run_id, actions).await?;
            let action_count = ctx.store.list_actions(&ctx.run_id).await?.len();
            info!(run_id = %ctx.run_id, added, action_count, "Action items stored");
            Ok(ActionsOutcome { action_count })
        })
        .await
}

/// Propose sales leads and update the job's lead summary.
pub async fn generate_leads(
    ctx: &StageContext,
    analysis: Option<&AnalysisOutcome>,
) -> Result<LeadsOutcome, PipelineError> {
    let settings = ctx.settings()?;
    let s = &settings;
    ctx.executor(s)
        .execute(&ctx.run_id, GENERATE_LEADS_STEP, || async move {
            let sources = ctx.store.list_sources(&ctx.run_id).await?;
            let insights = ctx.store.list_insights(&ctx.run_id).await?;
            let model = ctx.model(s)?;
            let prompt = leads_prompt(&ctx.job.topic, analysis, &sources, &insights);
            let list: LeadList = model.generate_json(&prompt).await?;

            let mut seen = HashSet::new();
            let leads: Vec<NewLead> = list
                .leads
                .into_iter()
                .filter(|l| !l.company.trim().is_empty())
                .filter(|l| seen.insert(l.company.trim().to_lowercase()))
                .map(|l| NewLead {
                    company: l.company.trim().to_string(),
                    contact_role: l.contact_role.filter(|r| !r.trim().is_empty()),
                    website: l.website.filter(|w| !w.trim().is_empty()),
                    rationale: l.rationale,
                    score: l.score.filter(|v| v.is_finite()),
                })
                .collect();
            let added = ctx
                .store
                .insert_leads(&ctx.run_id, &ctx.job.job_id, leads)
                .await?;
            let lead_count = ctx.store.list_leads(&ctx.run_id).await?.len();
            let summary = ctx
                .store
                .upsert_lead_summary(&ctx.job.job_id, &ctx.run_id)
                .await?;
            info!(
                run_id = %ctx.run_id,
                added,
                lead_count,
                total_leads = summary.total_leads,
                "Leads stored"
            );
            Ok(LeadsOutcome {
                lead_count,
                total_leads: summary.total_leads,
                generation_count: summary.generation_count,
            })
        })
        .await
}

/// Record the run's summary and output counts.
pub async fn finalize(ctx: &StageContext, outputs: &StageOutputs) -> Result<FinalReport, PipelineError> {
    let settings = ctx.settings()?;
    ctx.executor(&settings)
        .execute(&ctx.run_id, FINALIZE_STEP, || async move {
            let sources = ctx.store.count_sources(&ctx.run_id).await?;
            let insights = ctx.store.list_insights(&ctx.run_id).await?.len();
            let actions = ctx.store.list_actions(&ctx.run_id).await?.len();
            let leads = ctx.store.list_leads(&ctx.run_id).await?.len();

            let mut summary = format!(
                "Research on '{}': {sources} sources, {insights} insights, {actions} action items",
                ctx.job.topic
            );
            if ctx.job.include_leads {
                let _ = write!(summary, ", {leads} leads");
            }
            summary.push('.');
            let narrative = outputs
                .analysis
                .as_ref()
                .map(|a| a.summary.trim())
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    outputs
                        .discovery
                        .as_ref()
                        .and_then(|d| d.agent_summary.as_deref())
                });
            if let Some(text) = narrative {
                summary.push(' ');
                summary.push_str(text);
            }

            ctx.store.set_run_summary(&ctx.run_id, &summary).await?;
            Ok(FinalReport {
                sources,
                insights,
                actions,
                leads,
                summary,
            })
        })
        .await
}

/// Numbered source blocks, each cut to `max_chars` of content.
pub(crate) fn build_corpus(sources: &[SourceItem], max_chars: usize) -> String {
    let mut corpus = String::new();
    for (i, source) in sources.iter().enumerate() {
        let content: String = source.content.chars().take(max_chars).collect();
        let _ = writeln!(
            corpus,
            "[{}] {} ({})\n{}\n",
            i + 1,
            source.title,
            source.url,
            content.trim()
        );
    }
    corpus
}

fn normalize_priority(priority: Option<&str>) -> &'static str {
    match priority.map(|p| p.trim().to_lowercase()).as_deref() {
        Some("high") | Some("urgent") | Some("critical") => "high",
        Some("low") => "low",
        _ => "medium",
    }
}

fn findings_section(analysis: Option<&AnalysisOutcome>, insights: &[Insight]) -> String {
    let mut out = String::new();
    if let Some(a) = analysis {
        if !a.summary.trim().is_empty() {
            let _ = writeln!(out, "Summary: {}", a.summary.trim());
        }
        if !a.trends.is_empty() {
            let _ = writeln!(out, "Trends: {}", a.trends.join("; "));
        }
    }
    if !insights.is_empty() {
        out.push_str("Insights:\n");
        for insight in insights {
            let _ = writeln!(out, "- {}: {}", insight.title, insight.detail);
        }
    }
    out
}

fn actions_prompt(topic: &str, analysis: Option<&AnalysisOutcome>, insights: &[Insight]) -> String {
    format!(
        "Task: generate-actions\n\
         Topic: {topic}\n\n\
         Based on the research findings below, propose concrete next steps for a sales team. \
         Return JSON of the form {{\"actions\": [{{\"title\": str, \"description\": str, \
         \"priority\": \"high\" | \"medium\" | \"low\"}}]}}.\n\n\
         {}",
        findings_section(analysis, insights)
    )
}

fn leads_prompt(
    topic: &str,
    analysis: Option<&AnalysisOutcome>,
    sources: &[SourceItem],
    insights: &[Insight],
) -> String {
    let mut source_list = String::new();
    for source in sources {
        let _ = writeln!(source_list, "- {} ({})", source.title, source.url);
    }
    format!(
        "Task: generate-leads\n\
         Topic: {topic}\n\n\
         Identify companies that are promising prospects given the research below. \
         Return JSON of the form {{\"leads\": [{{\"company\": str, \"contact_role\": str, \
         \"website\": str, \"rationale\": str, \"score\": number between 0 and 1}}]}}.\n\n\
         {}\nSources:\n{source_list}",
        findings_section(analysis, insights)
    )
}
