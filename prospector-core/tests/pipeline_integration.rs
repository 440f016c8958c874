//! Integration tests for the research pipeline.
//!
//! Each test drives full runs through the orchestrator against an in-memory
//! store and the mock providers, then inspects the persisted records.

use pretty_assertions::assert_eq;
use prospector_core::config::{
    CapabilityConfig, PollConfig, ProviderConfig, RetryConfig, StaticConfigSource,
};
use prospector_core::pipeline::{DiscoveryStrategy, ResearchRequest, RetryOptions, Trigger};
use prospector_core::providers::mock::{
    MockAgent, MockCatalog, MockExtractor, MockInference, MockSearch, hits, transient_error,
};
use prospector_core::providers::{ProviderCatalog, SearchHit};
use prospector_core::store::{JobSettings, NewRun, RunStore, SqliteStore, StepStatus};
use prospector_core::{Orchestrator, PipelineError, PipelineSettings, RunStatus};
use std::sync::Arc;
use std::time::Duration;

const ANALYSIS: &str = r#"```json
{"insights": [
   {"title": "Demand rising", "detail": "Installations grew 20% year over year", "category": "market"},
   {"title": "Margins under pressure", "detail": "Panel prices keep falling"}
 ],
 "summary": "A growing but competitive market.",
 "trends": ["consolidation", "financing"]}
```"#;

const ACTIONS: &str = r#"{"actions": [
  {"title": "Contact regional distributors", "description": "Start with the top five", "priority": "High"},
  {"title": "Refresh pitch deck", "description": "Add financing angle", "priority": "sometime"}
]}"#;

const LEADS: &str = r#"{"leads": [
  {"company": "Acme Solar", "contact_role": "Head of Procurement", "rationale": "Expanding fleet", "score": 0.9},
  {"company": "Sunly", "website": "https://sunly.test", "rationale": "New funding round"},
  {"company": "acme solar", "rationale": "duplicate"}
]}"#;

const NO_GAPS: &str = r#"{"has_gaps": false, "suggested_queries": []}"#;

fn keyed(provider: &str) -> ProviderConfig {
    ProviderConfig {
        provider: provider.into(),
        api_key: Some("test-key".into()),
        ..ProviderConfig::default()
    }
}

fn capability(primary: ProviderConfig) -> CapabilityConfig {
    CapabilityConfig {
        primary: Some(primary),
        secondary: None,
        request_timeout_secs: 5,
    }
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.inference = capability(keyed("mock-llm"));
    settings.search = capability(keyed("mock-search"));
    settings.extraction = capability(ProviderConfig {
        provider: "mock-extract".into(),
        ..ProviderConfig::default()
    });
    settings.agent = capability(keyed("mock-agent"));
    settings.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    };
    settings.poll = PollConfig {
        interval_secs: 0,
        max_attempts: 5,
        baseline: 10,
        increment: 1,
        ceiling: 38,
    };
    settings
}

fn llm() -> MockInference {
    llm_with_gaps(NO_GAPS)
}

fn llm_with_gaps(gaps: &str) -> MockInference {
    MockInference::new()
        .respond_when("Task: analyze-content", ANALYSIS)
        .respond_when("Task: generate-actions", ACTIONS)
        .respond_when("Task: generate-leads", LEADS)
        .respond_when("Task: identify-gaps", gaps)
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<SqliteStore>,
    search: Arc<MockSearch>,
    extractor: Arc<MockExtractor>,
    llm: Arc<MockInference>,
    agent: Arc<MockAgent>,
    catalog: Arc<MockCatalog>,
}

struct Setup {
    store: Arc<SqliteStore>,
    search: MockSearch,
    llm: MockInference,
    agent: MockAgent,
    settings: PipelineSettings,
    extra_llm: Option<(&'static str, Arc<MockInference>)>,
}

impl Setup {
    fn new() -> Self {
        Self {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            search: MockSearch::with_urls("solar", 5),
            llm: llm(),
            agent: MockAgent::completing_after(0, hits("agent", 3)),
            settings: settings(),
            extra_llm: None,
        }
    }

    fn build(self) -> Harness {
        let search = Arc::new(self.search);
        let extractor = Arc::new(MockExtractor::new());
        let llm = Arc::new(self.llm);
        let agent = Arc::new(self.agent);
        let mut catalog = MockCatalog::new()
            .with_search("mock-search", search.clone())
            .with_extraction("mock-extract", extractor.clone())
            .with_inference("mock-llm", llm.clone())
            .with_agent("mock-agent", agent.clone());
        if let Some((name, client)) = self.extra_llm {
            catalog = catalog.with_inference(name, client);
        }
        let catalog = Arc::new(catalog);
        let orchestrator = Orchestrator::new(
            self.store.clone(),
            Arc::new(StaticConfigSource(self.settings)),
            catalog.clone() as Arc<dyn ProviderCatalog>,
        );
        Harness {
            orchestrator,
            store: self.store,
            search,
            extractor,
            llm,
            agent,
            catalog,
        }
    }
}

fn trigger(run_id: &str, job_id: &str) -> Trigger {
    Trigger {
        run_id: run_id.into(),
        job_id: job_id.into(),
        payload: ResearchRequest::new("solar installers"),
        retry_options: None,
    }
}

fn with_strategy(mut trigger: Trigger, strategy: DiscoveryStrategy) -> Trigger {
    trigger.payload.strategy = Some(strategy);
    trigger
}

fn with_leads(mut trigger: Trigger) -> Trigger {
    trigger.payload.include_leads = true;
    trigger
}

async fn step_names(store: &SqliteStore, run_id: &str, status: StepStatus) -> Vec<String> {
    store
        .list_steps(run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.status == status)
        .map(|s| s.name)
        .collect()
}

async fn wait_for_step(store: &SqliteStore, run_id: &str, step: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = store.get_step(run_id, step).await.unwrap() {
                if record.status == StepStatus::Done {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("step did not complete in time");
}

// --- Scenarios ---

#[tokio::test]
async fn test_no_sources_fails_and_keeps_progress() {
    let mut setup = Setup::new();
    setup.search = MockSearch::new(Vec::new());
    let h = setup.build();

    let run = h.orchestrator.execute(trigger("R1", "job-1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("no sources found"));
    assert_eq!(run.progress, 5);
    assert!(run.completed_at.is_some());
    assert_eq!(step_names(&h.store, "R1", StepStatus::Done).await, vec!["fetch-config"]);
    let discover = h.store.get_step("R1", "discover").await.unwrap().unwrap();
    assert_eq!(discover.status, StepStatus::Failed);
    assert_eq!(discover.attempts, 1);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_completed_run_without_leads() {
    let h = Setup::new().build();

    let run = h.orchestrator.execute(trigger("R2", "job-1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress, 100);
    assert!(run.error.is_none());
    assert_eq!(
        step_names(&h.store, "R2", StepStatus::Done).await,
        vec!["fetch-config", "discover", "analyze", "generate-actions", "finalize"]
    );
    assert_eq!(h.store.count_sources("R2").await.unwrap(), 5);
    assert_eq!(h.extractor.calls(), 5);

    let insights = h.store.list_insights("R2").await.unwrap();
    assert_eq!(insights.len(), 2);
    assert_eq!(insights[0].category.as_deref(), Some("market"));

    let actions = h.store.list_actions("R2").await.unwrap();
    let priorities: Vec<_> = actions.iter().map(|a| a.priority.as_str()).collect();
    assert_eq!(priorities, vec!["high", "medium"]);

    assert!(h.store.list_leads("R2").await.unwrap().is_empty());
    assert_eq!(h.llm.calls_matching("Task: generate-leads"), 0);

    let summary = run.summary.unwrap();
    assert!(summary.contains("5 sources, 2 insights, 2 action items"));
    assert!(summary.contains("A growing but competitive market."));
}

#[tokio::test]
async fn test_leads_are_deduplicated_and_summarised() {
    let h = Setup::new().build();

    let run = h
        .orchestrator
        .execute(with_leads(trigger("run-a", "job-1")))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(step_names(&h.store, "run-a", StepStatus::Done).await.len(), 6);
    let leads = h.store.list_leads("run-a").await.unwrap();
    let companies: Vec<_> = leads.iter().map(|l| l.company.as_str()).collect();
    assert_eq!(companies, vec!["Acme Solar", "Sunly"]);
    assert_eq!(leads[1].website.as_deref(), Some("https://sunly.test"));

    let summary = h.store.get_lead_summary("job-1").await.unwrap().unwrap();
    assert_eq!(summary.total_leads, 2);
    assert_eq!(summary.generation_count, 1);

    h.orchestrator
        .execute(with_leads(trigger("run-b", "job-1")))
        .await
        .unwrap();
    let summary = h.store.get_lead_summary("job-1").await.unwrap().unwrap();
    assert_eq!(summary.total_leads, 4);
    assert_eq!(summary.generation_count, 2);
    assert_eq!(summary.last_run_id, "run-b");
}

#[tokio::test]
async fn test_duplicate_urls_are_stored_once() {
    let mut setup = Setup::new();
    let mut dupes = hits("solar", 3);
    dupes.push(SearchHit {
        url: format!("{}#pricing", dupes[0].url),
        title: "Same page".into(),
        snippet: "again".into(),
    });
    dupes.push(dupes[1].clone());
    setup.search = MockSearch::new(dupes);
    let h = setup.build();

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.store.count_sources("r1").await.unwrap(), 3);
    assert_eq!(h.extractor.calls(), 3);
}

// --- Retries and resumption ---

#[tokio::test]
async fn test_transient_failures_are_retried_within_step() {
    let mut setup = Setup::new();
    setup.llm = llm().fail_times(2, transient_error);
    let h = setup.build();

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let analyze = h.store.get_step("r1", "analyze").await.unwrap().unwrap();
    assert_eq!(analyze.attempts, 3);
    assert_eq!(h.llm.calls_matching("Task: analyze-content"), 3);
}

#[tokio::test]
async fn test_retry_from_checkpoint_skips_completed_steps() {
    let mut setup = Setup::new();
    setup.llm = llm().fail_times(3, transient_error);
    let h = setup.build();

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("temporarily unavailable"));
    assert_eq!(run.progress, 40);
    assert_eq!(h.search.calls(), 1);

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error.is_none());
    assert_eq!(h.search.calls(), 1);
    assert_eq!(h.extractor.calls(), 5);
    let analyze = h.store.get_step("r1", "analyze").await.unwrap().unwrap();
    assert_eq!(analyze.attempts, 4);
    assert_eq!(h.store.count_sources("r1").await.unwrap(), 5);
}

#[tokio::test]
async fn test_interrupted_run_is_recovered_after_restart() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    let mut setup = Setup::new();
    setup.store = store.clone();
    setup.llm = MockInference::new()
        .respond_when("Task: analyze-content", ANALYSIS)
        .fallback("not json at all");
    let first = setup.build();
    let run = first.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        step_names(&store, "r1", StepStatus::Done).await,
        vec!["fetch-config", "discover", "analyze"]
    );

    // A crash leaves the run IN_PROGRESS with nobody driving it.
    store
        .update_run_status("r1", RunStatus::InProgress, None)
        .await
        .unwrap();

    let mut setup = Setup::new();
    setup.store = store.clone();
    let second = setup.build();
    let handles = second.orchestrator.recover_interrupted().await.unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].run_id(), "r1");
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap().status, RunStatus::Completed);
    }

    assert_eq!(second.search.calls(), 0);
    assert_eq!(second.extractor.calls(), 0);
    assert_eq!(second.llm.calls_matching("Task: analyze-content"), 0);
    assert_eq!(second.llm.calls_matching("Task: generate-actions"), 1);
    assert_eq!(store.list_insights("r1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_skip_discovery_reuses_previous_sources() {
    let h = Setup::new().build();
    h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    assert_eq!(h.search.calls(), 1);

    let mut retry = trigger("r2", "job-1");
    retry.retry_options = Some(RetryOptions {
        skip_discovery: true,
        ..RetryOptions::default()
    });
    let run = h.orchestrator.execute(retry).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.search.calls(), 1);
    assert_eq!(h.store.count_sources("r2").await.unwrap(), 5);
    let discover = h.store.get_step("r2", "discover").await.unwrap().unwrap();
    assert_eq!(discover.result.unwrap()["strategy"], "reuse-previous");
}

#[tokio::test]
async fn test_skip_discovery_without_prior_sources_fails() {
    let h = Setup::new().build();
    let mut retry = trigger("r1", "job-fresh");
    retry.retry_options = Some(RetryOptions {
        skip_discovery: true,
        ..RetryOptions::default()
    });

    let run = h.orchestrator.execute(retry).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("no sources found"));
    assert_eq!(h.search.calls(), 0);
}

// --- Discovery strategies ---

#[tokio::test]
async fn test_autonomous_agent_is_started_once_and_polled() {
    let mut setup = Setup::new();
    setup.agent = MockAgent::completing_after(2, hits("agent", 3));
    let h = setup.build();

    let run = h
        .orchestrator
        .execute(with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.agent.starts(), 1);
    assert_eq!(h.agent.checks(), 3);
    assert_eq!(h.search.calls(), 0);
    assert_eq!(h.store.count_sources("r1").await.unwrap(), 3);
    assert_eq!(
        step_names(&h.store, "r1", StepStatus::Done).await[..3],
        ["fetch-config", "discover-agent-start", "discover"]
    );
}

#[tokio::test]
async fn test_agent_failure_fails_run() {
    let mut setup = Setup::new();
    setup.agent = MockAgent::failing_after(1, "quota exceeded");
    let h = setup.build();

    let run = h
        .orchestrator
        .execute(with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Remote job failed: quota exceeded"));
}

#[tokio::test]
async fn test_poll_timeout_can_be_resumed_without_new_job() {
    let mut setup = Setup::new();
    setup.agent = MockAgent::never_finishing();
    setup.settings.poll.max_attempts = 3;
    let h = setup.build();
    let request = with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent);

    let run = h.orchestrator.execute(request.clone()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("did not finish after 3 checks"));
    assert_eq!(run.progress, 13);
    assert_eq!(h.agent.checks(), 3);

    let run = h.orchestrator.execute(request).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(h.agent.starts(), 1);
    assert_eq!(h.agent.checks(), 6);
}

#[tokio::test]
async fn test_iterative_loop_checkpoints_each_iteration() {
    let mut setup = Setup::new();
    setup.search = MockSearch::with_urls("solar", 5).on_query("solar subsidies", hits("subsidy", 2));
    setup.llm = llm_with_gaps(
        r#"{"has_gaps": true, "suggested_queries": ["solar subsidies", " Solar Subsidies "]}"#,
    );
    let h = setup.build();

    let run = h
        .orchestrator
        .execute(with_strategy(
            trigger("r1", "job-1"),
            DiscoveryStrategy::IterativeLoop { max_iterations: 2 },
        ))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        h.search.queries(),
        vec!["solar installers".to_string(), "solar subsidies".to_string()]
    );
    assert_eq!(h.llm.calls_matching("Task: identify-gaps"), 1);
    assert_eq!(h.store.count_sources("r1").await.unwrap(), 7);
    assert_eq!(
        step_names(&h.store, "r1", StepStatus::Done).await[..4],
        ["fetch-config", "discover-iteration-1", "discover-iteration-2", "discover"]
    );
}

#[tokio::test]
async fn test_iterative_loop_stops_without_gaps() {
    let h = Setup::new().build();

    let run = h
        .orchestrator
        .execute(with_strategy(
            trigger("r1", "job-1"),
            DiscoveryStrategy::IterativeLoop { max_iterations: 3 },
        ))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.search.calls(), 1);
    assert!(h.store.get_step("r1", "discover-iteration-2").await.unwrap().is_none());
}

// --- Providers ---

#[tokio::test]
async fn test_inference_falls_back_to_secondary() {
    let mut setup = Setup::new();
    setup.settings.inference = CapabilityConfig {
        primary: Some(ProviderConfig::new(
            "openai",
            Some("gpt-4o-mini"),
            "PROSPECTOR_IT_UNSET_OPENAI_KEY",
        )),
        secondary: Some(keyed("mock-llm")),
        request_timeout_secs: 5,
    };
    let h = setup.build();

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(
        h.catalog
            .inference_builds()
            .iter()
            .all(|(provider, _)| provider == "mock-llm")
    );
}

#[tokio::test]
async fn test_job_settings_and_retry_override_pick_inference() {
    let alt = Arc::new(llm());
    let mut setup = Setup::new();
    setup.extra_llm = Some(("alt-llm", alt.clone()));
    setup.settings.inference.secondary = Some(keyed("alt-llm"));
    let h = setup.build();

    h.store
        .put_job_settings(JobSettings {
            job_id: "job-1".into(),
            inference_provider: Some("alt-llm".into()),
            inference_model: Some("alt-large".into()),
            max_sources: Some(3),
        })
        .await
        .unwrap();

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.llm.calls(), 0);
    assert!(alt.calls() > 0);
    assert_eq!(h.store.count_sources("r1").await.unwrap(), 3);
    assert!(
        h.catalog
            .inference_builds()
            .contains(&("alt-llm".to_string(), Some("alt-large".to_string())))
    );

    let mut retry = trigger("r2", "job-1");
    retry.retry_options = Some(RetryOptions {
        skip_discovery: true,
        inference_provider: Some("mock-llm".into()),
        inference_model: None,
    });
    let run = h.orchestrator.execute(retry).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(h.llm.calls() > 0);
}

#[tokio::test]
async fn test_missing_search_credentials_fail_run() {
    let mut setup = Setup::new();
    setup.settings.search = capability(ProviderConfig::new(
        "exa",
        None,
        "PROSPECTOR_IT_UNSET_EXA_KEY",
    ));
    let h = setup.build();

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.unwrap();
    assert!(error.contains("No search provider available"), "{error}");
    let discover = h.store.get_step("r1", "discover").await.unwrap().unwrap();
    assert_eq!(discover.attempts, 1);
}

// --- Concurrency and cancellation ---

#[tokio::test]
async fn test_second_active_run_for_job_is_rejected() {
    let mut setup = Setup::new();
    setup.agent = MockAgent::never_finishing();
    setup.settings.poll.interval_secs = 1;
    setup.settings.poll.max_attempts = 1_000;
    let h = setup.build();

    let handle = h
        .orchestrator
        .start(with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent))
        .await
        .unwrap();
    wait_for_step(&h.store, "r1", "discover-agent-start").await;

    let err = h.orchestrator.execute(trigger("r2", "job-1")).await.unwrap_err();
    match err {
        PipelineError::AlreadyRunning { job_id, run_id } => {
            assert_eq!(job_id, "job-1");
            assert_eq!(run_id, "r1");
        }
        other => panic!("unexpected {other:?}"),
    }
    let err = h.orchestrator.start(trigger("r1", "job-1")).await.err().unwrap();
    assert!(matches!(err, PipelineError::AlreadyRunning { .. }));

    // Other jobs are unaffected.
    let other = h.orchestrator.execute(trigger("r3", "job-2")).await.unwrap();
    assert_eq!(other.status, RunStatus::Completed);

    h.orchestrator.cancel("r1").await.unwrap();
    let cancelled = handle.wait().await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let run = h.orchestrator.execute(trigger("r2", "job-1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let err = h.orchestrator.execute(trigger("r2", "job-1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyCompleted { .. }));
}

#[tokio::test]
async fn test_cancel_stops_polling() {
    let mut setup = Setup::new();
    setup.agent = MockAgent::never_finishing();
    setup.settings.poll.interval_secs = 1;
    setup.settings.poll.max_attempts = 1_000;
    let h = setup.build();

    let handle = h
        .orchestrator
        .start(with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent))
        .await
        .unwrap();
    wait_for_step(&h.store, "r1", "discover-agent-start").await;

    let run = h.orchestrator.cancel("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let finished = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run did not stop")
        .unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert!(finished.error.is_none());
    assert!(h.agent.checks() < 3);
    assert_eq!(h.llm.calls(), 0);
    let discover = h.store.get_step("r1", "discover").await.unwrap().unwrap();
    assert_eq!(discover.status, StepStatus::Failed);
}

#[tokio::test]
async fn test_cancellation_written_by_another_process_is_observed() {
    let mut setup = Setup::new();
    setup.agent = MockAgent::never_finishing();
    setup.settings.poll.interval_secs = 1;
    setup.settings.poll.max_attempts = 1_000;
    let h = setup.build();

    let handle = h
        .orchestrator
        .start(with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent))
        .await
        .unwrap();
    wait_for_step(&h.store, "r1", "discover-agent-start").await;

    h.store
        .update_run_status("r1", RunStatus::Cancelled, None)
        .await
        .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run did not observe cancellation")
        .unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_live_run_is_not_taken_over_by_another_orchestrator() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let agent_run = || with_strategy(trigger("r1", "job-1"), DiscoveryStrategy::AutonomousAgent);

    let mut setup = Setup::new();
    setup.store = store.clone();
    setup.agent = MockAgent::never_finishing();
    setup.settings.poll.interval_secs = 1;
    setup.settings.poll.max_attempts = 1_000;
    let first = setup.build();
    let handle = first.orchestrator.start(agent_run()).await.unwrap();
    wait_for_step(&store, "r1", "discover-agent-start").await;

    let mut setup = Setup::new();
    setup.store = store.clone();
    setup.agent = MockAgent::never_finishing();
    let second = setup.build();

    let err = second.orchestrator.start(agent_run()).await.err().unwrap();
    assert!(matches!(err, PipelineError::AlreadyRunning { ref run_id, .. } if run_id == "r1"));
    assert!(second.orchestrator.recover_interrupted().await.unwrap().is_empty());
    assert_eq!(second.agent.starts(), 0);
    assert_eq!(second.agent.checks(), 0);

    let held = store.get_run("r1").await.unwrap().unwrap();
    assert_eq!(held.owner.as_deref(), Some(first.orchestrator.owner()));

    first.orchestrator.cancel("r1").await.unwrap();
    let finished = handle.wait().await.unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert_eq!(finished.owner, None);
}

#[tokio::test]
async fn test_run_with_stale_lease_is_recovered() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store
        .create_run(NewRun {
            id: "r1".into(),
            job_id: "job-1".into(),
            payload: serde_json::to_value(ResearchRequest::new("solar installers")).unwrap(),
            retry_options: serde_json::json!({}),
        })
        .await
        .unwrap();
    // A driver that claimed the run and then vanished.
    store
        .claim_run("r1", "vanished-worker", Duration::from_secs(1))
        .await
        .unwrap();

    let mut setup = Setup::new();
    setup.store = store.clone();
    setup.settings.pipeline.lease_secs = 1;
    let h = setup.build();

    assert!(h.orchestrator.recover_interrupted().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let handles = h.orchestrator.recover_interrupted().await.unwrap();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        let run = handle.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.owner, None);
    }
    assert_eq!(h.search.calls(), 1);
}

#[tokio::test]
async fn test_retry_right_after_cancel_waits_for_the_stopping_task() {
    let mut setup = Setup::new();
    setup.llm = llm().with_latency(Duration::from_millis(300));
    let h = setup.build();

    let handle = h.orchestrator.start(trigger("r1", "job-1")).await.unwrap();
    wait_for_step(&h.store, "r1", "discover").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.llm.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("analysis never started");

    // The analysis call is still in flight and does not observe the token.
    h.orchestrator.cancel("r1").await.unwrap();
    let err = h.orchestrator.start(trigger("r1", "job-1")).await.err().unwrap();
    assert!(matches!(err, PipelineError::AlreadyRunning { .. }));

    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Cancelled);

    let run = h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let stored = h.orchestrator.status("r1").await.unwrap().run;
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.progress, 100);

    // Nothing left behind that would refuse the next run of the job.
    let next = h.orchestrator.execute(trigger("r2", "job-1")).await.unwrap();
    assert_eq!(next.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_status_snapshot_and_listing() {
    let h = Setup::new().build();
    h.orchestrator.execute(trigger("r1", "job-1")).await.unwrap();
    h.orchestrator.execute(trigger("r2", "job-2")).await.unwrap();

    let snapshot = h.orchestrator.status("r1").await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.steps.len(), 5);
    assert!(snapshot.steps.iter().all(|s| s.attempts == 1));

    let runs = h.orchestrator.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);

    let err = h.orchestrator.status("missing").await.unwrap_err();
    assert!(matches!(err, PipelineError::RunNotFound { .. }));
}
