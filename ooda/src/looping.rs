//! The SENSE → ORIENT → DECIDE → ACT loop for one run.
//!
//! Each iteration is resumable: an open iteration row, its stored verdict,
//! reconcile marks, and act checkpoints let a later `ooda resume` pick up
//! where an interrupted process stopped.

use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::act::{ActContext, ActCoordinator, ActReport, ActRequest};
use crate::core::claims::Claims;
use crate::core::decide::route;
use crate::core::learnings::{LearningsLog, contradicted_by_paths};
use crate::core::loop_detect::Gate;
use crate::core::reconcile::{ReconcilePlan, eligible_plan_tasks, plan_reconciliation};
use crate::core::types::{
    Decision, HumanInputKind, IterationOutcome, Outcome, RunStatus, Verdict,
};
use crate::error::{Interrupted, RetriesExhausted, StructuralHalt};
use crate::io::agent::{Agent, AgentRole};
use crate::io::config::OodaConfig;
use crate::io::git::Git;
use crate::io::learnings_store::{load_learnings, persist_learnings};
use crate::io::paths::OodaPaths;
use crate::io::signal::CancelFlag;
use crate::io::store::{AgentOutputRecord, IterationRecord, RunRecord, Store};
use crate::io::test_runner::TestRunner;
use crate::io::tracker::Tracker;
use crate::orient::{OrientRequest, Reasoner, verify};
use crate::reconcile::{ReconcileContext, ReconcileReport, apply_plan};
use crate::report::write_summary;
use crate::sense::{SenseContext, collect_claims};
use crate::validate::check_stored_verdict;

/// Everything one run of the loop talks to.
pub struct Engine<'a> {
    pub paths: &'a OodaPaths,
    pub config: &'a OodaConfig,
    pub store: &'a Store,
    pub git: &'a Git,
    pub reasoner: &'a dyn Reasoner,
    pub agent: &'a dyn Agent,
    pub tracker: &'a dyn Tracker,
    pub tests: &'a dyn TestRunner,
    pub cancel: &'a CancelFlag,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The reasoner judged the spec satisfied.
    Done { summary: String },
    /// No actionable work remains, or the reasoner is unavailable.
    Stuck { reason: String },
    /// This invocation ran its iteration budget.
    MaxIterations { max_iterations: u32 },
    /// A `pause` input was consumed; the run stays resumable.
    Paused,
    /// An `abort` input was consumed.
    Aborted { reason: String },
    /// Ctrl-C at an external-call boundary; the open iteration resumes later.
    Interrupted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub started_at_iter: u32,
    pub iterations_executed: u32,
    pub stop: LoopStop,
}

/// What one finished iteration did.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub number: u32,
    pub intent: String,
    pub decision: Decision,
    pub gate: Gate,
    pub reconcile: ReconcileReport,
    pub act: Option<ActReport>,
}

enum Step {
    Finished(Box<IterationReport>),
    Paused,
    Aborted(String),
}

/// Run iterations of `run_id` until DONE, STUCK, pause, abort, or
/// `max_iterations` iterations in this invocation.
///
/// A structural halt marks the run aborted with the diagnostics as its stop
/// reason and is returned as an error. Other errors leave the run resumable.
#[instrument(skip_all, fields(run_id = %run_id, max_iterations = max_iterations))]
pub fn run_loop<F: FnMut(&IterationReport)>(
    engine: &Engine<'_>,
    run_id: &str,
    max_iterations: u32,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let store = engine.store;
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("unknown run '{run_id}'"))?;
    if run.status != RunStatus::Running {
        bail!("run {run_id} is {}, not running", run.status.as_str());
    }
    let started_at_iter = match store.open_iteration(run_id)? {
        Some(open) => open.number,
        None => store.next_iteration_number(run_id)?,
    };

    let mut executed = 0u32;
    let outcome = |executed: u32, stop: LoopStop| LoopOutcome {
        run_id: run_id.to_string(),
        started_at_iter,
        iterations_executed: executed,
        stop,
    };

    loop {
        let record = match store.open_iteration(run_id)? {
            Some(open) => {
                info!(iteration = open.number, "resuming open iteration");
                open
            }
            None => {
                if executed >= max_iterations {
                    let reason = format!("max iterations ({max_iterations}) reached");
                    stop_run(engine, run_id, RunStatus::MaxIterations, &reason)?;
                    return Ok(outcome(executed, LoopStop::MaxIterations { max_iterations }));
                }
                store.start_iteration(run_id, store.next_iteration_number(run_id)?)?
            }
        };

        let step = match run_iteration(engine, &run, &record) {
            Ok(step) => step,
            Err(err) => {
                if err.downcast_ref::<Interrupted>().is_some() {
                    warn!(iteration = record.number, "interrupted; iteration left open");
                    return Ok(outcome(executed, LoopStop::Interrupted));
                }
                if let Some(halt) = err.downcast_ref::<StructuralHalt>() {
                    let reason = format!("structural halt: {halt}");
                    store.finish_iteration(record.id, IterationOutcome::Stuck)?;
                    stop_run(engine, run_id, RunStatus::Aborted, &reason)?;
                }
                return Err(err);
            }
        };
        executed += 1;

        match step {
            Step::Paused => {
                info!(iteration = record.number, "paused by human input");
                write_summary(engine.paths, store, run_id)?;
                return Ok(outcome(executed, LoopStop::Paused));
            }
            Step::Aborted(reason) => {
                stop_run(engine, run_id, RunStatus::Aborted, &reason)?;
                return Ok(outcome(executed, LoopStop::Aborted { reason }));
            }
            Step::Finished(report) => {
                on_iteration(report.as_ref());
                match report.decision.outcome {
                    Outcome::Done => {
                        let summary = report.decision.summary.clone().unwrap_or_default();
                        stop_run(engine, run_id, RunStatus::Completed, &summary)?;
                        return Ok(outcome(executed, LoopStop::Done { summary }));
                    }
                    Outcome::Stuck => {
                        let reason = report.decision.reason.clone().unwrap_or_default();
                        stop_run(engine, run_id, RunStatus::Stuck, &reason)?;
                        return Ok(outcome(executed, LoopStop::Stuck { reason }));
                    }
                    Outcome::Continue => {}
                }
            }
        }
    }
}

fn stop_run(engine: &Engine<'_>, run_id: &str, status: RunStatus, reason: &str) -> Result<()> {
    engine.store.set_run_status(run_id, status, Some(reason))?;
    write_summary(engine.paths, engine.store, run_id)?;
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run.id, iteration = record.number))]
fn run_iteration(engine: &Engine<'_>, run: &RunRecord, record: &IterationRecord) -> Result<Step> {
    let store = engine.store;
    let config = engine.config;
    let mut learnings = load_learnings(&engine.paths.learnings_log_path)?;
    let spec_path = engine.paths.resolve(&run.spec_path);

    // SENSE
    let claims = collect_claims(
        &SenseContext {
            git: engine.git,
            tracker: engine.tracker,
            store,
            spec_path: &spec_path,
            learnings: &learnings,
            detector: config.loop_detection.detector(),
            retry: config.retry.policy(),
            cancel: engine.cancel,
        },
        run,
        record.number,
    );
    engine.cancel.check()?;
    if claims.human.data().is_some_and(|human| human.spec_modified) {
        let current = fs::read_to_string(&spec_path)
            .with_context(|| format!("read spec {}", spec_path.display()))?;
        if !current.trim().is_empty() {
            store.record_spec_version(&run.id, &current)?;
        }
    }
    let spec = store
        .latest_spec(&run.id)?
        .map(|(content, _)| content)
        .unwrap_or_else(|| run.spec_content.clone());

    // ORIENT
    let (verdict, gate, fresh) = match store.stored_verdict(record.id)? {
        Some(parsed) => {
            info!("reusing verdict stored before the interruption");
            let verdict: Verdict =
                serde_json::from_str(&parsed).context("parse stored verdict")?;
            check_stored_verdict(&verdict, &claims)?;
            (verdict, Gate::Pass, false)
        }
        None => match run_orient(engine, run, record, &claims, &spec, &learnings) {
            Ok((verdict, gate)) => (verdict, gate, true),
            Err(err) => {
                let Some(exhausted) = err.downcast_ref::<RetriesExhausted>() else {
                    return Err(err);
                };
                let reason = format!("reasoner unavailable: {exhausted}");
                warn!(reason = %reason, "orient failed; stopping stuck");
                store.finish_iteration(record.id, IterationOutcome::Stuck)?;
                return Ok(Step::Finished(Box::new(IterationReport {
                    number: record.number,
                    intent: String::new(),
                    decision: Decision {
                        outcome: Outcome::Stuck,
                        reason: Some(reason),
                        summary: None,
                    },
                    gate: Gate::Pass,
                    reconcile: ReconcileReport::default(),
                    act: None,
                })));
            }
        },
    };

    if fresh {
        if let Some(step) = consume_human_inputs(store, record, &claims)? {
            return Ok(step);
        }
    }

    // DECIDE
    let open_tasks = claims.work().map(|work| work.open_count() as u32);
    store.set_iteration_plan(record.id, &verdict.iteration_plan.intent, open_tasks)?;
    let plan = plan_reconciliation(&verdict, &claims, record.number);
    let reconcile = apply_plan(
        &ReconcileContext {
            tracker: engine.tracker,
            store,
            retry: config.retry.policy(),
            cancel: engine.cancel,
        },
        record.id,
        &plan,
    )?;
    let decision = route(
        &verdict,
        claims.stagnation().map(|flag| flag.message.as_str()),
    );
    decision.validate()?;
    info!(outcome = decision.outcome.as_str(), "decision routed");

    // ACT
    let act = if decision.outcome == Outcome::Continue {
        run_act(engine, run, record, &verdict, &claims, &plan, &spec, &learnings)?
    } else {
        None
    };
    if let Some(report) = &act {
        store.set_failing_tests(record.id, &report.failing_tests)?;
    }

    update_learnings(engine, &mut learnings, record.number, &verdict, &claims, act.as_ref())?;
    store.finish_iteration(record.id, iteration_outcome(decision.outcome))?;

    Ok(Step::Finished(Box::new(IterationReport {
        number: record.number,
        intent: verdict.iteration_plan.intent.clone(),
        decision,
        gate,
        reconcile,
        act,
    })))
}

/// Invoke the reasoner, verify its verdict, and store it for resumption.
fn run_orient(
    engine: &Engine<'_>,
    run: &RunRecord,
    record: &IterationRecord,
    claims: &Claims,
    spec: &str,
    learnings: &LearningsLog,
) -> Result<(Verdict, Gate)> {
    let valid = learnings.valid();
    let raw = engine.reasoner.orient(&OrientRequest {
        run_id: &run.id,
        workdir: engine.git.workdir(),
        spec,
        claims,
        learnings: &valid,
    })?;
    let verified = verify(&raw.raw, claims)?;
    let verdict = verified.verdict;
    let summary = verdict
        .summary
        .clone()
        .unwrap_or_else(|| verdict.iteration_plan.intent.clone());
    engine.store.insert_agent_output(&AgentOutputRecord {
        iteration_id: record.id,
        role: AgentRole::Orient.as_str().to_string(),
        task_id: None,
        transcript_path: raw.transcript_path.display().to_string(),
        summary,
        parsed: serde_json::to_string(&verdict).context("serialize verdict")?,
    })?;
    Ok((verdict, verified.gate))
}

/// Consume the inputs this verdict saw. Abort wins over pause.
fn consume_human_inputs(
    store: &Store,
    record: &IterationRecord,
    claims: &Claims,
) -> Result<Option<Step>> {
    let Some(human) = claims.human.data() else {
        return Ok(None);
    };
    let ids: Vec<i64> = human.inputs.iter().map(|input| input.id).collect();
    store.consume_inputs(&ids, record.number)?;
    if let Some(abort) = human
        .inputs
        .iter()
        .find(|input| input.kind == HumanInputKind::Abort)
    {
        store.finish_iteration(record.id, IterationOutcome::Stuck)?;
        let reason = match abort.content.trim() {
            "" => "aborted by human input".to_string(),
            content => format!("aborted by human input: {content}"),
        };
        return Ok(Some(Step::Aborted(reason)));
    }
    if human.has(HumanInputKind::Pause) {
        return Ok(Some(Step::Paused));
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn run_act(
    engine: &Engine<'_>,
    run: &RunRecord,
    record: &IterationRecord,
    verdict: &Verdict,
    claims: &Claims,
    plan: &ReconcilePlan,
    spec: &str,
    learnings: &LearningsLog,
) -> Result<Option<ActReport>> {
    let Some(work) = claims.work() else {
        warn!("work claims unavailable; skipping act");
        return Ok(None);
    };
    let (eligible, skipped) = eligible_plan_tasks(verdict, work, plan);
    for item in &skipped {
        info!(task_id = %item.subject, reason = %item.reason, "planned task not eligible");
    }
    let tasks: Vec<_> = eligible
        .iter()
        .filter_map(|id| work.find(id).cloned())
        .collect();
    if tasks.is_empty() {
        info!("no eligible tasks this iteration");
        return Ok(None);
    }

    let valid = learnings.valid();
    let ctx = ActContext {
        git: engine.git,
        agent: engine.agent,
        tracker: engine.tracker,
        tests: engine.tests,
        store: engine.store,
        config: engine.config,
        paths: engine.paths,
        cancel: engine.cancel,
    };
    let request = ActRequest {
        run,
        iteration: record,
        tasks,
        intent: &verdict.iteration_plan.intent,
        approach: &verdict.iteration_plan.approach,
        spec,
        learnings: &valid,
    };
    ActCoordinator::new(&ctx, request).run().map(Some)
}

/// Fold this iteration's learnings into the log and re-render `learnings.md`.
fn update_learnings(
    engine: &Engine<'_>,
    log: &mut LearningsLog,
    iteration: u32,
    verdict: &Verdict,
    claims: &Claims,
    act: Option<&ActReport>,
) -> Result<()> {
    let mut events = Vec::new();
    for text in &verdict.learnings {
        events.extend(log.add(text, iteration, AgentRole::Orient.as_str()));
    }
    for deprecated in &verdict.deprecated_learnings {
        events.extend(log.deprecate(&deprecated.id, &deprecated.reason, iteration));
    }
    if let Some(code) = claims.code.data() {
        for (id, reason) in contradicted_by_paths(log, &code.path_checks) {
            events.extend(log.deprecate(&id, &reason, iteration));
        }
    }
    if let Some(report) = act {
        for text in &report.learnings {
            events.extend(log.add(text, iteration, AgentRole::Act.as_str()));
        }
    }
    if events.is_empty() {
        return Ok(());
    }
    info!(events = events.len(), "learnings updated");
    persist_learnings(
        &engine.paths.learnings_log_path,
        &engine.paths.learnings_md_path,
        log,
        &events,
    )
}

fn iteration_outcome(outcome: Outcome) -> IterationOutcome {
    match outcome {
        Outcome::Done => IterationOutcome::Done,
        Outcome::Stuck => IterationOutcome::Stuck,
        Outcome::Continue => IterationOutcome::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::act::ActState;
    use crate::core::types::{ActStatus, Severity, TaskAction, TaskStatus};
    use crate::io::paths::ensure_layout;
    use crate::io::store::NewRun;
    use crate::orient::AgentReasoner;
    use crate::test_support::{
        MemoryTracker, ScriptedAgent, ScriptedResponse, ScriptedTestRunner, TestRepo, act_json, gap,
        planning_verdict, satisfied_verdict, task, test_report, update, verdict,
    };

    struct Fixture {
        repo: TestRepo,
        git: Git,
        paths: OodaPaths,
        store: Store,
        tracker: MemoryTracker,
        agent: ScriptedAgent,
        tests: ScriptedTestRunner,
        config: OodaConfig,
        cancel: CancelFlag,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TestRepo::new().expect("repo");
            repo.write("SPEC.md", "# Todo API\n- list todos\n").expect("spec");
            repo.commit_all("add spec").expect("commit");
            let paths = ensure_layout(repo.root()).expect("layout");
            let git = Git::new(repo.root());
            let base = git.head_sha().expect("head");
            let store = Store::open_in_memory().expect("store");
            store
                .create_run(&NewRun {
                    id: "run-1",
                    spec_path: "SPEC.md",
                    spec_content: "# Todo API\n- list todos\n",
                    root_task_id: "root",
                    milestone_branch: "main",
                    base_commit: &base,
                })
                .expect("run");
            let mut config = OodaConfig::default();
            config.retry.max_attempts = 1;
            config.retry.base_delay_ms = 0;
            config.retry.max_delay_ms = 0;
            Self {
                repo,
                git,
                paths,
                store,
                tracker: MemoryTracker::with_tasks(vec![
                    task("root", TaskStatus::Open),
                    task("t1", TaskStatus::Open),
                ]),
                agent: ScriptedAgent::new(),
                tests: ScriptedTestRunner::new(Vec::new()),
                config,
                cancel: CancelFlag::new(),
            }
        }

        fn run(&self, max_iterations: u32) -> Result<LoopOutcome> {
            let reasoner = AgentReasoner::new(
                &self.agent,
                &self.config.agent,
                &self.paths.transcripts_dir,
                &self.paths.schemas_dir,
                self.config.retry.policy(),
                &self.cancel,
            );
            let engine = Engine {
                paths: &self.paths,
                config: &self.config,
                store: &self.store,
                git: &self.git,
                reasoner: &reasoner,
                agent: &self.agent,
                tracker: &self.tracker,
                tests: &self.tests,
                cancel: &self.cancel,
            };
            run_loop(&engine, "run-1", max_iterations, |_| {})
        }

        fn status(&self) -> RunStatus {
            self.store.get_run("run-1").expect("get").expect("run").status
        }
    }

    #[test]
    fn satisfied_spec_is_done_on_first_iteration_without_act() {
        let fx = Fixture::new();
        fx.agent.push_verdict(&satisfied_verdict("All criteria verified"));

        let outcome = fx.run(5).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Done {
                summary: "All criteria verified".to_string()
            }
        );
        assert_eq!(outcome.iterations_executed, 1);
        assert_eq!(fx.agent.calls(AgentRole::Act), 0);
        assert_eq!(fx.status(), RunStatus::Completed);
        assert!(fx.paths.summary_path("run-1").exists());
    }

    #[test]
    fn continue_then_close_then_done() {
        let fx = Fixture::new();
        fx.agent.push_verdict(&planning_verdict("Implement listing", &["t1"]));
        fx.agent.push(
            AgentRole::Act,
            ScriptedResponse::output(act_json("t1", ActStatus::Completed, "listing added"))
                .with_edit("src/list.rs", "pub fn list() {}\n"),
        );
        let mut done = satisfied_verdict("Listing works");
        done.task_updates = vec![update("t1", TaskAction::Close, "list() in src/list.rs")];
        done.learnings = vec!["Listing lives in `src/list.rs`".to_string()];
        fx.agent.push_verdict(&done);

        let mut reports = Vec::new();
        let reasoner = AgentReasoner::new(
            &fx.agent,
            &fx.config.agent,
            &fx.paths.transcripts_dir,
            &fx.paths.schemas_dir,
            fx.config.retry.policy(),
            &fx.cancel,
        );
        let engine = Engine {
            paths: &fx.paths,
            config: &fx.config,
            store: &fx.store,
            git: &fx.git,
            reasoner: &reasoner,
            agent: &fx.agent,
            tracker: &fx.tracker,
            tests: &fx.tests,
            cancel: &fx.cancel,
        };
        let outcome = run_loop(&engine, "run-1", 5, |report| {
            reports.push((report.number, report.decision.outcome, report.act.clone()));
        })
        .expect("loop");

        assert!(matches!(outcome.stop, LoopStop::Done { .. }));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].1, Outcome::Continue);
        let act = reports[0].2.as_ref().expect("act ran");
        assert_eq!(act.state, ActState::Done);
        assert!(act.merged);
        assert!(fx.repo.root().join("src/list.rs").exists());
        assert_eq!(fx.tracker.task("t1").expect("t1").status, TaskStatus::Closed);

        let learnings = load_learnings(&fx.paths.learnings_log_path).expect("learnings");
        assert_eq!(learnings.valid().len(), 1);
        let iterations = fx.store.recent_iterations("run-1", 5).expect("iterations");
        assert_eq!(iterations[0].outcome, IterationOutcome::Continue);
        assert_eq!(iterations[0].intent, "Implement listing");
        assert_eq!(iterations[1].outcome, IterationOutcome::Done);
    }

    #[test]
    fn no_actionable_work_is_stuck_with_gap_reason() {
        let fx = Fixture::new();
        let mut v = verdict();
        v.actionable_work_exists = false;
        v.gaps = vec![gap("Needs a database decision", Severity::Blocking)];
        fx.agent.push_verdict(&v);

        let outcome = fx.run(5).expect("loop");
        let LoopStop::Stuck { reason } = outcome.stop else {
            panic!("expected stuck");
        };
        assert!(reason.contains("Needs a database decision"));
        let run = fx.store.get_run("run-1").expect("get").expect("run");
        assert_eq!(run.status, RunStatus::Stuck);
        assert_eq!(run.stop_reason.as_deref(), Some(reason.as_str()));
    }

    #[test]
    fn iteration_budget_stops_with_max_iterations() {
        let fx = Fixture::new();
        fx.agent.push_verdict(&verdict());
        fx.agent.push_verdict(&verdict());

        let outcome = fx.run(2).expect("loop");
        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 2 });
        assert_eq!(outcome.iterations_executed, 2);
        assert_eq!(fx.status(), RunStatus::MaxIterations);
    }

    #[test]
    fn unavailable_reasoner_stops_stuck() {
        let fx = Fixture::new();
        fx.agent
            .push(AgentRole::Orient, ScriptedResponse::failure("HTTP 503 service unavailable"));

        let outcome = fx.run(3).expect("loop");
        let LoopStop::Stuck { reason } = outcome.stop else {
            panic!("expected stuck");
        };
        assert!(reason.starts_with("reasoner unavailable"));
    }

    #[test]
    fn malformed_verdict_halts_and_aborts_the_run() {
        let fx = Fixture::new();
        fx.agent.push(AgentRole::Orient, ScriptedResponse::output("not json"));

        let err = fx.run(3).unwrap_err();
        assert!(err.downcast_ref::<StructuralHalt>().is_some());
        let run = fx.store.get_run("run-1").expect("get").expect("run");
        assert_eq!(run.status, RunStatus::Aborted);
        assert!(run.stop_reason.expect("reason").contains("Invalid JSON"));
    }

    #[test]
    fn pause_keeps_run_resumable_and_resume_reuses_the_verdict() {
        let fx = Fixture::new();
        fx.store
            .add_human_input(Some("run-1"), HumanInputKind::Pause, "")
            .expect("input");
        fx.agent.push_verdict(&satisfied_verdict("done already"));

        let outcome = fx.run(5).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Paused);
        assert_eq!(fx.status(), RunStatus::Running);
        assert!(fx.store.open_iteration("run-1").expect("open").is_some());

        let outcome = fx.run(5).expect("resume");
        assert_eq!(outcome.started_at_iter, 1);
        assert!(matches!(outcome.stop, LoopStop::Done { .. }));
        assert_eq!(fx.agent.calls(AgentRole::Orient), 1);
    }

    #[test]
    fn abort_input_stops_the_run() {
        let fx = Fixture::new();
        fx.store
            .add_human_input(None, HumanInputKind::Abort, "wrong spec")
            .expect("input");
        fx.agent.push_verdict(&verdict());

        let outcome = fx.run(5).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Aborted {
                reason: "aborted by human input: wrong spec".to_string()
            }
        );
        assert_eq!(fx.status(), RunStatus::Aborted);
        assert!(fx.store.pending_inputs("run-1").expect("inputs").is_empty());
    }

    #[test]
    fn cancellation_leaves_the_iteration_open() {
        let fx = Fixture::new();
        fx.cancel.cancel();
        let outcome = fx.run(5).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Interrupted);
        assert_eq!(fx.status(), RunStatus::Running);
        assert!(fx.store.open_iteration("run-1").expect("open").is_some());
    }

    #[test]
    fn spec_change_is_versioned_and_shown_to_the_reasoner() {
        let fx = Fixture::new();
        fx.repo
            .write("SPEC.md", "# Todo API\n- list todos\n- delete todos\n")
            .expect("spec");
        fx.agent.push_verdict(&satisfied_verdict("ok"));

        fx.run(1).expect("loop");
        let (latest, _) = fx.store.latest_spec("run-1").expect("spec").expect("some");
        assert!(latest.contains("delete todos"));
        let prompt = &fx.agent.requests()[0].prompt;
        assert!(prompt.contains("delete todos"));
    }

    #[test]
    fn persistent_baseline_failure_does_not_stall_distinct_work() {
        let fx = Fixture {
            tests: ScriptedTestRunner::new(vec![test_report(&["a"], &["legacy::flaky"])]),
            ..Fixture::new()
        };
        for (step, file) in [("Add listing", "list"), ("Add paging", "page"), ("Add sorting", "sort")] {
            fx.agent.push_verdict(&planning_verdict(step, &["t1"]));
            fx.agent.push(
                AgentRole::Act,
                ScriptedResponse::output(act_json("t1", ActStatus::Completed, step))
                    .with_edit(&format!("src/{file}.rs"), "pub fn f() {}\n"),
            );
        }

        let outcome = fx.run(3).expect("loop");
        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 3 });
        assert_eq!(fx.agent.calls(AgentRole::Act), 3);
        let iterations = fx.store.recent_iterations("run-1", 5).expect("iterations");
        assert!(iterations.iter().all(|it| it.failing_tests.is_empty()));
        assert!(fx.repo.root().join("src/sort.rs").exists());
    }

    #[test]
    fn stored_verdict_with_vanished_task_halts_on_resume() {
        let fx = Fixture::new();
        let iteration = fx.store.start_iteration("run-1", 1).expect("iteration");
        let stored = planning_verdict("Gone", &["t9"]);
        fx.store
            .insert_agent_output(&AgentOutputRecord {
                iteration_id: iteration.id,
                role: AgentRole::Orient.as_str().to_string(),
                task_id: None,
                transcript_path: String::new(),
                summary: String::new(),
                parsed: serde_json::to_string(&stored).expect("json"),
            })
            .expect("stored verdict");

        let err = fx.run(3).unwrap_err();
        let halt = err.downcast_ref::<StructuralHalt>().expect("halt");
        assert_eq!(halt.kind, crate::error::HaltKind::ReferentialIntegrity);
        assert_eq!(halt.fields[0].field, "iteration_plan.tasks[0]");
        assert_eq!(fx.agent.calls(AgentRole::Orient), 0);
        assert_eq!(fx.status(), RunStatus::Aborted);
    }
}
