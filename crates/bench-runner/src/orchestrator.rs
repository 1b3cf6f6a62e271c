use crate::agent::{AgentInvoker, AgentRequest, AgentRun, ProgressSink};
use crate::cancel::CancellationToken;
use crate::config::ProgressConfig;
use crate::environment::EnvironmentManager;
use crate::registry::Registry;
use crate::reporter::Reporter;
use crate::selection::{resolve_definitions, RunSelection};
use crate::state::StateStore;
use anyhow::{anyhow, Context, Result};
use bench_core::{
    BenchmarkDefinition, CampaignSummary, ExecutionOutcome, FlagValidationMode, ProgressEvent,
    RunEvidence,
};
use bench_parser::{parse_output, validate_strict_pattern, ParsedOutput};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignPhase {
    Loading,
    Selecting,
    /// 1-based index of the benchmark in flight.
    Running(usize),
    Reporting,
    Done,
    Interrupted,
}

/// The resolved, resume-filtered work list for one campaign.
#[derive(Debug, Clone)]
pub struct CampaignPlan {
    pub selection: RunSelection,
    pub benchmarks: Vec<BenchmarkDefinition>,
    /// Selected ids the registry does not know.
    pub missing: Vec<String>,
    /// Selected ids dropped because they already completed.
    pub already_completed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub run_dir: PathBuf,
    pub summary: CampaignSummary,
    pub interrupted: bool,
}

enum PipelineStep {
    Outcome(ExecutionOutcome),
    Interrupted,
}

enum AgentInvocation {
    Finished(AgentRun),
    Interrupted,
}

/// Resolves `selection` against the catalog and, when resuming, drops
/// completed benchmarks. Selecting nothing the catalog knows is an error.
pub fn plan_campaign(
    registry: &Registry,
    selection: RunSelection,
    state: &StateStore,
) -> Result<CampaignPlan> {
    let (mut benchmarks, missing) = resolve_definitions(&selection.benchmark_ids, registry.catalog());
    for id in &missing {
        warn!(benchmark_id = %id, "benchmark not found in registry");
    }
    if benchmarks.is_empty() {
        return Err(anyhow!("no valid benchmarks selected"));
    }
    let mut already_completed = Vec::new();
    if selection.resume {
        let ids: Vec<String> = benchmarks.iter().map(|b| b.id.clone()).collect();
        let remaining = state.remaining(&ids);
        benchmarks.retain(|b| {
            let keep = remaining.contains(&b.id);
            if !keep {
                already_completed.push(b.id.clone());
            }
            keep
        });
        info!(
            remaining = benchmarks.len(),
            skipped = already_completed.len(),
            "resuming campaign"
        );
    }
    Ok(CampaignPlan {
        selection,
        benchmarks,
        missing,
        already_completed,
    })
}

/// Whether the transcript evidences success under `mode`.
pub fn evaluate_flag(mode: FlagValidationMode, expected_flag: &str, parsed: &ParsedOutput) -> bool {
    let expected = expected_flag.to_lowercase();
    let exact = parsed.tokens.iter().any(|t| t.to_lowercase() == expected);
    match mode {
        FlagValidationMode::Exact => exact,
        // An agent-reported count of zero does not override a captured match.
        FlagValidationMode::AnyFlag => exact || parsed.effective_flag_count() > 0,
        FlagValidationMode::StrictPattern => {
            parsed.tokens.iter().any(|t| validate_strict_pattern(t))
        }
    }
}

/// Calls `stop` for a benchmark exactly once: explicitly through
/// `complete`, or on drop if the pipeline unwinds past it.
struct TeardownGuard<'a> {
    environment: &'a dyn EnvironmentManager,
    definition: &'a BenchmarkDefinition,
    done: bool,
}

impl<'a> TeardownGuard<'a> {
    fn new(environment: &'a dyn EnvironmentManager, definition: &'a BenchmarkDefinition) -> Self {
        Self {
            environment,
            definition,
            done: false,
        }
    }

    fn complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let stopped = panic::catch_unwind(AssertUnwindSafe(|| {
            self.environment.stop(self.definition)
        }));
        match stopped {
            Ok(report) if !report.success => warn!(
                benchmark_id = %self.definition.id,
                message = %report.message,
                "environment teardown failed"
            ),
            Ok(_) => {}
            Err(payload) => error!(
                benchmark_id = %self.definition.id,
                panic = %panic_message(&*payload),
                "environment teardown panicked"
            ),
        }
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        self.complete();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn warn_on_err(result: Result<()>, what: &str) {
    if let Err(err) = result {
        warn!(error = %format!("{:#}", err), "{}", what);
    }
}

pub struct Orchestrator {
    environment: Arc<dyn EnvironmentManager>,
    agent: Arc<dyn AgentInvoker>,
    state: StateStore,
    cancel: CancellationToken,
    progress: ProgressConfig,
    stop_grace: Duration,
    phase: CampaignPhase,
}

impl Orchestrator {
    pub fn new(
        environment: Arc<dyn EnvironmentManager>,
        agent: Arc<dyn AgentInvoker>,
        state: StateStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            environment,
            agent,
            state,
            cancel,
            progress: ProgressConfig::default(),
            stop_grace: Duration::from_secs(10),
            phase: CampaignPhase::Loading,
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    /// Time past the per-benchmark deadline after which an agent that has
    /// not returned is told to stop.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn phase(&self) -> CampaignPhase {
        self.phase
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Loading and Selecting: scans nothing itself, but resolves the plan
    /// against an already loaded registry.
    pub fn plan(&mut self, registry: &Registry, selection: RunSelection) -> Result<CampaignPlan> {
        self.phase = CampaignPhase::Selecting;
        plan_campaign(registry, selection, &self.state)
    }

    pub fn run(&mut self, plan: &CampaignPlan) -> Result<CampaignReport> {
        let selection = &plan.selection;
        let started_at = Utc::now();
        let mut reporter = Reporter::create(&selection.output_dir, &started_at)?;
        let total = plan.benchmarks.len();
        warn_on_err(
            reporter.log_campaign_start(total, selection.timeout.as_secs(), selection.mode, selection.resume),
            "failed to record campaign start",
        );

        let mut outcomes: Vec<ExecutionOutcome> = Vec::with_capacity(total);
        let mut interrupted = false;
        for (index, definition) in plan.benchmarks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                interrupted = true;
                warn_on_err(
                    reporter.log_interrupted(None, outcomes.len()),
                    "failed to record interruption",
                );
                break;
            }
            self.phase = CampaignPhase::Running(index + 1);
            warn_on_err(
                reporter.log_start(definition, index + 1, total),
                "failed to record benchmark start",
            );
            match self.run_benchmark(definition, selection, &mut reporter) {
                Some(outcome) => outcomes.push(outcome),
                None => {
                    interrupted = true;
                    warn_on_err(
                        reporter.log_interrupted(Some(&definition.id), outcomes.len()),
                        "failed to record interruption",
                    );
                    break;
                }
            }
        }

        if interrupted {
            warn_on_err(self.state.save(), "failed to flush state after interrupt");
            println!("Resume with: --resume");
        }

        self.phase = CampaignPhase::Reporting;
        let summary = CampaignSummary::from_outcomes(&outcomes, started_at, Utc::now(), interrupted);
        if outcomes.is_empty() {
            info!("no benchmarks finished; summary not written");
        } else {
            warn_on_err(
                reporter.write_summary(&summary),
                "failed to write campaign summary",
            );
        }
        self.phase = if interrupted {
            CampaignPhase::Interrupted
        } else {
            CampaignPhase::Done
        };
        Ok(CampaignReport {
            run_dir: reporter.run_dir().to_path_buf(),
            summary,
            interrupted,
        })
    }

    /// Runs one benchmark end to end. `None` means the campaign was
    /// interrupted and nothing was recorded.
    fn run_benchmark(
        &mut self,
        definition: &BenchmarkDefinition,
        selection: &RunSelection,
        reporter: &mut Reporter,
    ) -> Option<ExecutionOutcome> {
        let start_time = Utc::now();
        let mut teardown = TeardownGuard::new(self.environment.as_ref(), definition);

        let step = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute_pipeline(definition, selection, reporter, start_time)
        }));
        let outcome = match step {
            Ok(Ok(PipelineStep::Outcome(outcome))) => Some(outcome),
            Ok(Ok(PipelineStep::Interrupted)) => None,
            Ok(Err(err)) => {
                error!(benchmark_id = %definition.id, error = %format!("{:#}", err), "benchmark pipeline failed");
                Some(ExecutionOutcome::error(
                    definition,
                    format!("unexpected error: {:#}", err),
                    start_time,
                    Utc::now(),
                ))
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(benchmark_id = %definition.id, panic = %message, "benchmark pipeline panicked");
                Some(ExecutionOutcome::error(
                    definition,
                    format!("unexpected error: panic: {}", message),
                    start_time,
                    Utc::now(),
                ))
            }
        };

        if let Some(outcome) = &outcome {
            if let Err(err) = self.state.mark_completed(&definition.id, outcome.success) {
                warn!(
                    benchmark_id = %definition.id,
                    error = %format!("{:#}", err),
                    "failed to persist state"
                );
            }
            warn_on_err(reporter.log_result(outcome), "failed to record benchmark result");
            info!(
                benchmark_id = %definition.id,
                status = %outcome.status,
                elapsed_secs = outcome.duration_seconds,
                cost_usd = outcome.cost_usd,
                "benchmark finished"
            );
        }
        teardown.complete();
        outcome
    }

    fn execute_pipeline(
        &self,
        definition: &BenchmarkDefinition,
        selection: &RunSelection,
        reporter: &mut Reporter,
        start_time: DateTime<Utc>,
    ) -> Result<PipelineStep> {
        let started = self.environment.start(definition);
        if self.cancel.is_cancelled() {
            return Ok(PipelineStep::Interrupted);
        }
        if !started.success {
            return Ok(PipelineStep::Outcome(ExecutionOutcome::error(
                definition,
                format!("environment start failed: {}", started.message),
                start_time,
                Utc::now(),
            )));
        }
        let endpoint = started
            .endpoint
            .ok_or_else(|| anyhow!("environment reported success without an endpoint"))?;

        let request = AgentRequest {
            benchmark_id: definition.id.clone(),
            target: endpoint.url(),
            timeout: selection.timeout,
            transcript_path: reporter.transcript_path(&definition.id),
        };
        let run = match self.invoke_agent(request, reporter)? {
            AgentInvocation::Finished(run) => run,
            AgentInvocation::Interrupted => return Ok(PipelineStep::Interrupted),
        };
        if self.cancel.is_cancelled() {
            return Ok(PipelineStep::Interrupted);
        }

        let parsed = parse_output(&run.output_lines);
        let correct_flag = evaluate_flag(selection.mode, &definition.expected_flag, &parsed);
        debug!(
            benchmark_id = %definition.id,
            tokens = parsed.tokens.len(),
            reported = ?parsed.reported_flag_count,
            correct_flag,
            "transcript parsed"
        );
        let evidence = RunEvidence {
            found_flags: parsed.tokens,
            correct_flag,
            timed_out: run.timed_out,
            has_error: parsed.has_error,
            cost_usd: parsed.cost_usd,
            session_id: parsed.session_id,
            error_message: parsed.error_message,
        };
        Ok(PipelineStep::Outcome(ExecutionOutcome::from_evidence(
            definition,
            evidence,
            start_time,
            Utc::now(),
        )))
    }

    /// Runs the agent on its own thread and drains its progress queue until
    /// the thread finishes.
    fn invoke_agent(&self, request: AgentRequest, reporter: &mut Reporter) -> Result<AgentInvocation> {
        let (tx, rx) = mpsc::sync_channel::<ProgressEvent>(self.progress.queue_capacity.max(1));
        let sink = ProgressSink::new(tx);
        let stop = CancellationToken::new();
        let hard_deadline = Instant::now() + request.timeout + self.stop_grace;

        let agent = Arc::clone(&self.agent);
        let thread_stop = stop.clone();
        let thread_request = request.clone();
        let handle = thread::Builder::new()
            .name(format!("agent-{}", request.benchmark_id))
            .spawn(move || agent.invoke(&thread_request, &sink, &thread_stop))
            .context("failed to spawn agent thread")?;

        let mut forced = false;
        loop {
            if !stop.is_cancelled() {
                if self.cancel.is_cancelled() {
                    info!(benchmark_id = %request.benchmark_id, "interrupt: stopping agent");
                    stop.cancel();
                } else if Instant::now() >= hard_deadline {
                    warn!(benchmark_id = %request.benchmark_id, "agent ignored its deadline; stopping");
                    forced = true;
                    stop.cancel();
                }
            }
            match rx.try_recv() {
                Ok(event) => self.forward_progress(&request.benchmark_id, &event, reporter),
                Err(TryRecvError::Empty) => {
                    if handle.is_finished() {
                        for event in rx.try_iter() {
                            self.forward_progress(&request.benchmark_id, &event, reporter);
                        }
                        break;
                    }
                    thread::sleep(self.progress.poll_interval());
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        let joined = handle
            .join()
            .map_err(|payload| anyhow!("agent thread panicked: {}", panic_message(&*payload)));
        if self.cancel.is_cancelled() {
            return Ok(AgentInvocation::Interrupted);
        }
        let mut run = joined?.context("agent invocation failed")?;
        if forced {
            run.timed_out = true;
        }
        Ok(AgentInvocation::Finished(run))
    }

    fn forward_progress(&self, benchmark_id: &str, event: &ProgressEvent, reporter: &mut Reporter) {
        debug!(benchmark_id, kind = event.kind(), tool = event.tool(), "agent progress");
        if let ProgressEvent::ToolStart { tool, detail } = event {
            match detail {
                Some(detail) => println!("    → {} {}", tool, detail),
                None => println!("    → {}", tool),
            }
        }
        warn_on_err(
            reporter.log_progress(benchmark_id, event),
            "failed to record progress event",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::environment::{Endpoint, StartReport, StopReport};
    use bench_core::{OutcomeStatus, RUN_EVENTS_FILE, RUN_SUMMARY_JSON_FILE};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[derive(Default)]
    struct FakeEnvironment {
        fail_start: bool,
        panic_on_start: bool,
        panic_on_stop: bool,
        /// Occupies the summary path of every run dir under this root.
        block_summary_under: Option<PathBuf>,
        starts: AtomicUsize,
        stops: Mutex<Vec<String>>,
    }

    impl EnvironmentManager for FakeEnvironment {
        fn start(&self, definition: &BenchmarkDefinition) -> StartReport {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_start {
                panic!("runtime exploded for {}", definition.id);
            }
            if self.fail_start {
                return StartReport {
                    success: false,
                    endpoint: None,
                    message: "build failed: boom".to_string(),
                };
            }
            StartReport {
                success: true,
                endpoint: Some(Endpoint {
                    host: "127.0.0.1".to_string(),
                    port: 8080,
                }),
                message: "ok".to_string(),
            }
        }

        fn stop(&self, definition: &BenchmarkDefinition) -> StopReport {
            self.stops
                .lock()
                .expect("stops lock")
                .push(definition.id.clone());
            if let Some(root) = &self.block_summary_under {
                for entry in fs::read_dir(root).expect("output dir") {
                    let run_dir = entry.expect("entry").path();
                    if run_dir.is_dir() {
                        fs::create_dir_all(run_dir.join(RUN_SUMMARY_JSON_FILE))
                            .expect("block summary");
                    }
                }
            }
            if self.panic_on_stop {
                panic!("teardown exploded for {}", definition.id);
            }
            StopReport {
                success: true,
                message: "stopped".to_string(),
            }
        }
    }

    impl FakeEnvironment {
        fn stops(&self) -> Vec<String> {
            self.stops.lock().expect("stops lock").clone()
        }
    }

    enum Behavior {
        Lines(Vec<&'static str>),
        TimedOut(Vec<&'static str>),
        Fail,
        Panic,
        /// Cancels the campaign, then blocks until asked to stop.
        InterruptCampaign(CancellationToken),
        /// Ignores its deadline until stopped.
        Hang,
    }

    struct FakeAgent {
        behaviors: Mutex<Vec<Behavior>>,
        invocations: AtomicUsize,
    }

    impl FakeAgent {
        fn new(behaviors: Vec<Behavior>) -> Self {
            Self {
                behaviors: Mutex::new(behaviors),
                invocations: AtomicUsize::new(0),
            }
        }
    }

    impl AgentInvoker for FakeAgent {
        fn invoke(
            &self,
            request: &AgentRequest,
            progress: &ProgressSink,
            stop: &CancellationToken,
        ) -> Result<AgentRun> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behaviors.lock().expect("behaviors").remove(0);
            progress.emit(ProgressEvent::ToolStart {
                tool: "http".to_string(),
                detail: Some(request.target.clone()),
            });
            let lines = |raw: Vec<&str>| -> Vec<String> {
                raw.into_iter().map(|s| s.to_string()).collect()
            };
            match behavior {
                Behavior::Lines(raw) => Ok(AgentRun {
                    output_lines: lines(raw),
                    ..AgentRun::default()
                }),
                Behavior::TimedOut(raw) => Ok(AgentRun {
                    output_lines: lines(raw),
                    timed_out: true,
                    cancelled: false,
                }),
                Behavior::Fail => Err(anyhow!("agent crashed")),
                Behavior::Panic => panic!("agent bug"),
                Behavior::InterruptCampaign(campaign) => {
                    campaign.cancel();
                    while !stop.is_cancelled() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(AgentRun {
                        cancelled: true,
                        ..AgentRun::default()
                    })
                }
                Behavior::Hang => {
                    while !stop.is_cancelled() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(AgentRun {
                        output_lines: vec!["flag{late}".to_string()],
                        cancelled: true,
                        ..AgentRun::default()
                    })
                }
            }
        }
    }

    fn definition(root: &Path, ordinal: u32) -> BenchmarkDefinition {
        let id = NamingConfig::default().format_id(ordinal);
        BenchmarkDefinition {
            path: root.join(&id),
            name: format!("bench {}", ordinal),
            level: 1,
            tags: Vec::new(),
            expected_flag: format!("FLAG{{expected-{}}}", ordinal),
            id,
        }
    }

    struct Harness {
        root: TempDirGuard,
        environment: Arc<FakeEnvironment>,
        agent: Arc<FakeAgent>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new(prefix: &str, environment: FakeEnvironment, behaviors: Vec<Behavior>) -> Self {
            Self {
                root: TempDirGuard::new(prefix),
                environment: Arc::new(environment),
                agent: Arc::new(FakeAgent::new(behaviors)),
                cancel: CancellationToken::new(),
            }
        }

        fn state_path(&self) -> PathBuf {
            self.root.path.join("logs").join("state.json")
        }

        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(
                self.environment.clone(),
                self.agent.clone(),
                StateStore::open(&self.state_path()),
                self.cancel.clone(),
            )
            .with_progress(ProgressConfig {
                queue_capacity: 4,
                poll_interval_ms: 1,
            })
            .with_stop_grace(Duration::from_millis(50))
        }

        fn plan(&self, ordinals: &[u32], mode: FlagValidationMode, timeout: Duration) -> CampaignPlan {
            CampaignPlan {
                selection: RunSelection {
                    benchmark_ids: Vec::new(),
                    timeout,
                    mode,
                    output_dir: self.root.path.join("logs"),
                    resume: false,
                },
                benchmarks: ordinals
                    .iter()
                    .map(|o| definition(&self.root.path, *o))
                    .collect(),
                missing: Vec::new(),
                already_completed: Vec::new(),
            }
        }
    }

    fn parsed(tokens: &[&str], reported: Option<u32>) -> ParsedOutput {
        ParsedOutput {
            tokens: tokens.iter().map(|s| s.to_string()).collect(),
            reported_flag_count: reported,
            ..ParsedOutput::default()
        }
    }

    #[test]
    fn flag_evaluation_per_mode() {
        let expected = "FLAG{Expected}";
        assert!(evaluate_flag(
            FlagValidationMode::Exact,
            expected,
            &parsed(&["flag{expected}"], None)
        ));
        assert!(!evaluate_flag(
            FlagValidationMode::Exact,
            expected,
            &parsed(&["flag{other}"], None)
        ));
        assert!(evaluate_flag(
            FlagValidationMode::AnyFlag,
            expected,
            &parsed(&["flag{other}"], None)
        ));
        assert!(!evaluate_flag(
            FlagValidationMode::AnyFlag,
            expected,
            &parsed(&["flag{other}"], Some(0))
        ));
        assert!(evaluate_flag(
            FlagValidationMode::AnyFlag,
            expected,
            &parsed(&[], Some(2))
        ));
        assert!(evaluate_flag(
            FlagValidationMode::AnyFlag,
            expected,
            &parsed(&["FLAG{expected}"], Some(0))
        ));
        let strict = format!("flag{{{}}}", "a".repeat(32));
        assert!(evaluate_flag(
            FlagValidationMode::StrictPattern,
            expected,
            &parsed(&["flag{short}", strict.as_str()], None)
        ));
        assert!(!evaluate_flag(
            FlagValidationMode::StrictPattern,
            expected,
            &parsed(&["flag{short}"], None)
        ));
    }

    #[test]
    fn campaign_records_outcomes_in_order_and_tears_down_each() {
        let harness = Harness::new(
            "bench_orch_basic",
            FakeEnvironment::default(),
            vec![
                Behavior::Lines(vec![
                    "[INFO] working",
                    "got flag{expected-1}",
                    "[DONE] Flags: 1, Cost: $0.42, Session: s-1",
                ]),
                Behavior::Lines(vec!["nothing here"]),
                Behavior::TimedOut(vec!["FLAG{expected-3}"]),
            ],
        );
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1, 2, 3], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");

        assert!(!report.interrupted);
        assert_eq!(orchestrator.phase(), CampaignPhase::Done);
        let statuses: Vec<_> = report.summary.results.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![OutcomeStatus::Success, OutcomeStatus::Failure, OutcomeStatus::Timeout]
        );
        let first = &report.summary.results[0];
        assert_eq!(first.cost_usd, 0.42);
        assert_eq!(first.session_id, "s-1");
        assert!(!report.summary.results[2].success);
        assert!(report.summary.results[2].timeout_occurred);

        assert_eq!(
            harness.environment.stops(),
            vec!["XBEN-001-24", "XBEN-002-24", "XBEN-003-24"]
        );
        let state = StateStore::open(&harness.state_path());
        assert!(state.is_completed("XBEN-001-24"));
        assert!(state.state().failed.contains("XBEN-002-24"));
        assert!(state.state().failed.contains("XBEN-003-24"));

        assert!(report.run_dir.join(RUN_SUMMARY_JSON_FILE).is_file());
        let events = fs::read_to_string(report.run_dir.join(RUN_EVENTS_FILE)).expect("events");
        assert_eq!(events.matches("\"event\":\"progress\"").count(), 3);
        assert_eq!(events.matches("\"event\":\"benchmark_result\"").count(), 3);
    }

    #[test]
    fn environment_failure_is_error_with_single_teardown() {
        let harness = Harness::new(
            "bench_orch_envfail",
            FakeEnvironment {
                fail_start: true,
                ..FakeEnvironment::default()
            },
            Vec::new(),
        );
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");
        let outcome = &report.summary.results[0];
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("environment start failed: build failed: boom")
        );
        assert_eq!(harness.agent.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(harness.environment.stops(), vec!["XBEN-001-24"]);
    }

    #[test]
    fn agent_error_and_panic_still_tear_down_once() {
        let harness = Harness::new(
            "bench_orch_agentfail",
            FakeEnvironment::default(),
            vec![Behavior::Fail, Behavior::Panic],
        );
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1, 2], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");

        let results = &report.summary.results;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|o| o.status == OutcomeStatus::Error));
        assert!(results[0]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("agent crashed"));
        assert!(results[1]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("agent thread panicked: agent bug"));
        assert_eq!(harness.environment.stops(), vec!["XBEN-001-24", "XBEN-002-24"]);
    }

    #[test]
    fn environment_panic_is_contained() {
        let harness = Harness::new(
            "bench_orch_envpanic",
            FakeEnvironment {
                panic_on_start: true,
                ..FakeEnvironment::default()
            },
            Vec::new(),
        );
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");
        let outcome = &report.summary.results[0];
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("runtime exploded for XBEN-001-24"));
        assert_eq!(harness.environment.stops(), vec!["XBEN-001-24"]);
    }

    #[test]
    fn teardown_panic_does_not_abort_campaign() {
        let harness = Harness::new(
            "bench_orch_stoppanic",
            FakeEnvironment {
                panic_on_stop: true,
                ..FakeEnvironment::default()
            },
            vec![
                Behavior::Lines(vec!["flag{expected-1}"]),
                Behavior::Lines(vec!["nothing"]),
            ],
        );
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1, 2], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");

        assert_eq!(orchestrator.phase(), CampaignPhase::Done);
        let statuses: Vec<_> = report.summary.results.iter().map(|o| o.status).collect();
        assert_eq!(statuses, vec![OutcomeStatus::Success, OutcomeStatus::Failure]);
        assert_eq!(harness.environment.stops(), vec!["XBEN-001-24", "XBEN-002-24"]);
        let state = StateStore::open(&harness.state_path());
        assert!(state.is_completed("XBEN-001-24"));
        assert!(state.state().failed.contains("XBEN-002-24"));
    }

    #[test]
    fn summary_write_failure_keeps_interrupted_report() {
        let cancel = CancellationToken::new();
        let mut harness = Harness::new(
            "bench_orch_summaryfail",
            FakeEnvironment::default(),
            vec![
                Behavior::Lines(vec!["flag{expected-1}"]),
                Behavior::InterruptCampaign(cancel.clone()),
            ],
        );
        harness.cancel = cancel;
        Arc::get_mut(&mut harness.environment)
            .expect("sole owner")
            .block_summary_under = Some(harness.root.path.join("logs"));
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1, 2], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run survives summary failure");

        assert!(report.interrupted);
        assert!(report.summary.interrupted);
        assert_eq!(orchestrator.phase(), CampaignPhase::Interrupted);
        assert_eq!(report.summary.results.len(), 1);
        assert!(report.run_dir.join(RUN_SUMMARY_JSON_FILE).is_dir());
        let state = StateStore::open(&harness.state_path());
        assert!(state.is_completed("XBEN-001-24"));
    }

    #[test]
    fn interrupt_mid_benchmark_tears_down_without_recording() {
        let cancel = CancellationToken::new();
        let mut harness = Harness::new(
            "bench_orch_interrupt",
            FakeEnvironment::default(),
            vec![
                Behavior::Lines(vec!["flag{expected-1}"]),
                Behavior::InterruptCampaign(cancel.clone()),
                Behavior::Lines(vec!["never reached"]),
            ],
        );
        harness.cancel = cancel;
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1, 2, 3], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");

        assert!(report.interrupted);
        assert_eq!(orchestrator.phase(), CampaignPhase::Interrupted);
        assert_eq!(report.summary.results.len(), 1);
        assert!(report.summary.interrupted);
        assert_eq!(harness.environment.stops(), vec!["XBEN-001-24", "XBEN-002-24"]);
        assert_eq!(harness.agent.invocations.load(Ordering::SeqCst), 2);

        let state = StateStore::open(&harness.state_path());
        assert!(state.is_completed("XBEN-001-24"));
        assert!(!state.is_completed("XBEN-002-24"));
        assert!(!state.state().failed.contains("XBEN-002-24"));

        let events = fs::read_to_string(report.run_dir.join(RUN_EVENTS_FILE)).expect("events");
        assert!(events.contains("\"event\":\"interrupted\""));
        assert!(events.contains("\"benchmark_id\":\"XBEN-002-24\""));
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let harness = Harness::new(
            "bench_orch_precancel",
            FakeEnvironment::default(),
            vec![Behavior::Lines(vec![])],
        );
        harness.cancel.cancel();
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1], FlagValidationMode::Exact, Duration::from_secs(30));
        let report = orchestrator.run(&plan).expect("run");
        assert!(report.interrupted);
        assert!(report.summary.results.is_empty());
        assert_eq!(harness.environment.starts.load(Ordering::SeqCst), 0);
        assert!(harness.environment.stops().is_empty());
        assert!(!report.run_dir.join(RUN_SUMMARY_JSON_FILE).exists());
    }

    #[test]
    fn agent_ignoring_deadline_is_stopped_and_times_out() {
        let harness = Harness::new(
            "bench_orch_hang",
            FakeEnvironment::default(),
            vec![Behavior::Hang],
        );
        let mut orchestrator = harness.orchestrator();
        let plan = harness.plan(&[1], FlagValidationMode::AnyFlag, Duration::from_millis(20));
        let report = orchestrator.run(&plan).expect("run");
        let outcome = &report.summary.results[0];
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(!outcome.success);
        assert_eq!(harness.environment.stops(), vec!["XBEN-001-24"]);
    }

    fn write_benchmark(root: &Path, ordinal: u32, flag: &str) {
        let dir = root.join(NamingConfig::default().format_id(ordinal));
        fs::create_dir_all(&dir).expect("dir");
        fs::write(
            dir.join("benchmark.json"),
            format!(r#"{{"name": "b{}", "level": 1, "tags": ["xss"]}}"#, ordinal),
        )
        .expect("metadata");
        fs::write(dir.join(".env"), format!("FLAG=\"{}\"\n", flag)).expect("env");
        fs::write(dir.join("docker-compose.yml"), "services: {}\n").expect("compose");
    }

    #[test]
    fn subprocess_campaign_then_retry_and_resume() {
        use crate::agent::CommandAgent;
        use crate::config::{AgentConfig, EnvironmentConfig};
        use crate::environment::ComposeEnvironment;
        use crate::process::CommandSpec;
        use crate::selection::load_retry_plan;

        let root = TempDirGuard::new("bench_orch_e2e");
        let bench_root = root.path.join("benchmarks");
        write_benchmark(&bench_root, 1, "flag{one}");
        write_benchmark(&bench_root, 2, "flag{two}");
        let registry = Registry::load(&bench_root, &NamingConfig::default()).expect("registry");

        let sh = |script: &str| CommandSpec::new("sh", &["-c", script]);
        let environment = Arc::new(ComposeEnvironment::new(EnvironmentConfig {
            build: sh("echo build >> steps.log"),
            up: sh("echo up >> steps.log"),
            ports: sh("echo '0.0.0.0:32768->80/tcp'"),
            down: sh("echo down >> steps.log"),
            target_host: "127.0.0.1".to_string(),
            ..EnvironmentConfig::default()
        }));
        let script = concat!(
            r#"echo '{"type":"tool_start","tool":"curl","detail":"{target}"}'; "#,
            r#"case {benchmark_id} in XBEN-001-24) echo 'got flag{one}';; *) echo 'got flag{nope}';; esac; "#,
            r#"echo '[DONE] Flags: 1, Cost: $0.25, Session: sess-{benchmark_id}'"#,
        );
        let agent = Arc::new(CommandAgent::new(AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..AgentConfig::default()
        }));
        let output_dir = root.path.join("logs");
        let state_path = output_dir.join("state.json");
        let selection = |ids: Vec<String>, resume| RunSelection {
            benchmark_ids: ids,
            timeout: Duration::from_secs(30),
            mode: FlagValidationMode::Exact,
            output_dir: output_dir.clone(),
            resume,
        };

        let mut orchestrator = Orchestrator::new(
            environment.clone(),
            agent.clone(),
            StateStore::open(&state_path),
            CancellationToken::new(),
        );
        let plan = orchestrator
            .plan(
                &registry,
                selection(vec!["XBEN-001-24".to_string(), "XBEN-002-24".to_string()], false),
            )
            .expect("plan");
        let report = orchestrator.run(&plan).expect("run");
        assert_eq!(report.summary.total_benchmarks, 2);
        assert_eq!(report.summary.successful, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.total_cost_usd, 0.5);
        assert_eq!(report.summary.results[0].session_id, "sess-XBEN-001-24");

        for id in ["XBEN-001-24", "XBEN-002-24"] {
            let steps = fs::read_to_string(bench_root.join(id).join("steps.log")).expect("steps");
            assert_eq!(steps, "build\nup\ndown\n");
            let transcript_path = report.run_dir.join("benchmarks").join(format!("{}.log", id));
            let transcript = fs::read_to_string(transcript_path).expect("transcript");
            assert!(transcript.contains("[DONE]"));
        }
        let events = fs::read_to_string(report.run_dir.join(RUN_EVENTS_FILE)).expect("events");
        assert!(events.contains("\"tool\":\"curl\""));
        assert!(events.contains("\"detail\":\"http://127.0.0.1:32768\""));
        assert!(report.run_dir.join("summary.txt").is_file());

        let retry = load_retry_plan(None, &output_dir).expect("retry plan");
        assert_eq!(retry.run_dir, report.run_dir);
        assert_eq!(retry.benchmark_ids(), vec!["XBEN-002-24".to_string()]);

        let mut resumed = Orchestrator::new(
            environment,
            agent,
            StateStore::open(&state_path),
            CancellationToken::new(),
        );
        let plan = resumed
            .plan(
                &registry,
                selection(vec!["XBEN-001-24".to_string(), "XBEN-002-24".to_string()], true),
            )
            .expect("plan");
        assert_eq!(plan.already_completed, vec!["XBEN-001-24".to_string()]);
        let ids: Vec<_> = plan.benchmarks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["XBEN-002-24"]);
    }

    #[test]
    fn resume_plan_skips_completed_only() {
        let root = TempDirGuard::new("bench_orch_plan");
        let bench_root = root.path.join("benchmarks");
        for ordinal in 1..=3 {
            let dir = bench_root.join(NamingConfig::default().format_id(ordinal));
            fs::create_dir_all(&dir).expect("dir");
            fs::write(
                dir.join("benchmark.json"),
                format!(r#"{{"name": "b{}", "level": 1}}"#, ordinal),
            )
            .expect("metadata");
            fs::write(dir.join(".env"), format!("FLAG=flag{{{}}}\n", ordinal)).expect("env");
        }
        let registry = Registry::load(&bench_root, &NamingConfig::default()).expect("registry");
        let mut state = StateStore::open(&root.path.join("state.json"));
        state.mark_completed("XBEN-002-24", true).expect("mark");
        state.mark_completed("XBEN-003-24", false).expect("mark");

        let selection = |resume| RunSelection {
            benchmark_ids: vec![
                "XBEN-003-24".to_string(),
                "XBEN-002-24".to_string(),
                "XBEN-009-24".to_string(),
                "XBEN-001-24".to_string(),
            ],
            timeout: Duration::from_secs(900),
            mode: FlagValidationMode::Exact,
            output_dir: root.path.join("logs"),
            resume,
        };
        let plan = plan_campaign(&registry, selection(true), &state).expect("plan");
        let ids: Vec<_> = plan.benchmarks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["XBEN-003-24", "XBEN-001-24"]);
        assert_eq!(plan.missing, vec!["XBEN-009-24"]);
        assert_eq!(plan.already_completed, vec!["XBEN-002-24"]);

        let plan = plan_campaign(&registry, selection(false), &state).expect("plan");
        assert_eq!(plan.benchmarks.len(), 3);

        let nothing = RunSelection {
            benchmark_ids: vec!["XBEN-050-24".to_string()],
            ..selection(false)
        };
        assert!(plan_campaign(&registry, nothing, &state).is_err());
    }
}
