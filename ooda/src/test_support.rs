//! Test-only helpers: temp git repos, scripted collaborators, and builders.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::baseline::TestReport;
use crate::core::claims::{Claims, HumanClaims, ProjectClaims, Section, WorkClaims};
use crate::core::types::{
    ActOutput, ActStatus, Confidence, Gap, IterationPlan, Priority, Severity, SpecSatisfied, Task,
    TaskAction, TaskComment, TaskStatus, TaskUpdate, Verdict,
};
use crate::io::agent::{Agent, AgentRequest, AgentRole};
use crate::io::test_runner::TestRunner;
use crate::io::tracker::{TaskChange, TaskDraft, Tracker};

// ----------------------------------------------------------------------
// Git repositories
// ----------------------------------------------------------------------

/// A throwaway git repository on branch `main` with one commit (`README.md`).
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let repo = Self::empty()?;
        repo.write("README.md", "hi\n")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-m", "chore: init"])?;
        Ok(repo)
    }

    /// Initialized repository without any commit.
    pub fn empty() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_file(self.root(), rel, contents)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Stage everything and commit.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-m", message])?;
        Ok(())
    }

    /// Run git in the repository, failing on a non-zero exit.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn write_file(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

// ----------------------------------------------------------------------
// Scripted agent
// ----------------------------------------------------------------------

/// One queued agent response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    /// Raw text written to the output path.
    pub output: String,
    /// Files written into the workdir before returning, as `(path, contents)`.
    pub edits: Vec<(String, String)>,
    /// When set, the invocation fails with this message after applying edits.
    pub error: Option<String>,
}

impl ScriptedResponse {
    pub fn output(raw: impl Into<String>) -> Self {
        Self {
            output: raw.into(),
            ..Self::default()
        }
    }

    pub fn with_edit(mut self, rel: &str, contents: &str) -> Self {
        self.edits.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Agent returning queued responses per role, recording each request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    queues: RefCell<HashMap<AgentRole, VecDeque<ScriptedResponse>>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: AgentRole, response: ScriptedResponse) -> &Self {
        self.queues
            .borrow_mut()
            .entry(role)
            .or_default()
            .push_back(response);
        self
    }

    pub fn push_verdict(&self, verdict: &Verdict) -> &Self {
        self.push(AgentRole::Orient, ScriptedResponse::output(verdict_json(verdict)))
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self, role: AgentRole) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.role == role)
            .count()
    }

    pub fn remaining(&self, role: AgentRole) -> usize {
        self.queues.borrow().get(&role).map_or(0, VecDeque::len)
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        self.requests.borrow_mut().push(request.clone());
        let response = self
            .queues
            .borrow_mut()
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted {} response left", request.role.as_str()))?;
        for (rel, contents) in &response.edits {
            write_file(&request.workdir, rel, contents)?;
        }
        if let Some(message) = response.error {
            return Err(anyhow!(message));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.output_path, response.output)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// In-memory tracker
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackerState {
    tasks: BTreeMap<String, Task>,
    comments: Vec<TaskComment>,
    next_id: u32,
    failures: VecDeque<(String, String)>,
    calls: Vec<String>,
}

/// Tracker holding tasks in memory. Created tasks get ids `t1`, `t2`, ...
#[derive(Debug, Default)]
pub struct MemoryTracker {
    state: RefCell<TrackerState>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let tracker = Self::new();
        {
            let mut state = tracker.state.borrow_mut();
            for task in tasks {
                state.tasks.insert(task.id.clone(), task);
            }
        }
        tracker
    }

    /// Fail the next call of `op` (`list`, `create`, `close`, ...) with `message`.
    pub fn fail_next(&self, op: &str, message: &str) {
        self.state
            .borrow_mut()
            .failures
            .push_back((op.to_string(), message.to_string()));
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.state.borrow().tasks.get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state.borrow().tasks.values().cloned().collect()
    }

    pub fn comments_for(&self, id: &str) -> Vec<String> {
        self.state
            .borrow()
            .comments
            .iter()
            .filter(|c| c.task_id == id)
            .map(|c| c.text.clone())
            .collect()
    }

    /// Mutating calls made so far, e.g. `create:t3`, `close:t1`.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn check(&self, op: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.failures.front().is_some_and(|(failing, _)| failing == op) {
            return Ok(());
        }
        match state.failures.pop_front() {
            Some((_, message)) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

impl Tracker for MemoryTracker {
    fn list(&self) -> Result<Vec<Task>> {
        self.check("list")?;
        Ok(self.tasks())
    }

    fn create(&self, draft: &TaskDraft) -> Result<String> {
        self.check("create")?;
        let mut state = self.state.borrow_mut();
        let id = loop {
            state.next_id += 1;
            let candidate = format!("t{}", state.next_id);
            if !state.tasks.contains_key(&candidate) {
                break candidate;
            }
        };
        state.tasks.insert(
            id.clone(),
            Task {
                id: id.clone(),
                title: draft.title.clone(),
                description: draft.description.clone(),
                status: TaskStatus::Open,
                priority: draft.priority,
                blocker_reason: None,
                parent_id: draft.parent_id.clone(),
                blocked_by: Vec::new(),
            },
        );
        state.calls.push(format!("create:{id}"));
        Ok(id)
    }

    fn close(&self, task_id: &str, message: &str) -> Result<()> {
        self.check("close")?;
        let mut state = self.state.borrow_mut();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("unknown task {task_id}"))?;
        task.status = TaskStatus::Closed;
        task.blocker_reason = None;
        state.comments.push(TaskComment {
            task_id: task_id.to_string(),
            text: message.to_string(),
            source: "ooda".to_string(),
            created_at: String::new(),
        });
        state.calls.push(format!("close:{task_id}"));
        Ok(())
    }

    fn update(&self, task_id: &str, change: &TaskChange) -> Result<()> {
        self.check("update")?;
        let mut state = self.state.borrow_mut();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("unknown task {task_id}"))?;
        if let Some(status) = change.status {
            task.status = status;
            task.blocker_reason = if status == TaskStatus::Blocked {
                change.reason.clone()
            } else {
                None
            };
        }
        if let Some(priority) = change.priority {
            task.priority = priority;
        }
        if let Some(parent) = &change.parent_id {
            task.parent_id = Some(parent.clone());
        }
        state.calls.push(format!("update:{task_id}"));
        Ok(())
    }

    fn comment(&self, task_id: &str, text: &str) -> Result<()> {
        self.check("comment")?;
        let mut state = self.state.borrow_mut();
        if !state.tasks.contains_key(task_id) {
            return Err(anyhow!("unknown task {task_id}"));
        }
        state.comments.push(TaskComment {
            task_id: task_id.to_string(),
            text: text.to_string(),
            source: "ooda".to_string(),
            created_at: String::new(),
        });
        state.calls.push(format!("comment:{task_id}"));
        Ok(())
    }

    fn comments(&self, task_id: &str) -> Result<Vec<TaskComment>> {
        self.check("comments")?;
        Ok(self
            .state
            .borrow()
            .comments
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect())
    }
}

// ----------------------------------------------------------------------
// Scripted test runner
// ----------------------------------------------------------------------

/// Returns queued results in order, then repeats the last report.
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    results: RefCell<VecDeque<Result<TestReport, String>>>,
    last: RefCell<Option<TestReport>>,
    runs: RefCell<usize>,
}

impl ScriptedTestRunner {
    pub fn new(reports: Vec<TestReport>) -> Self {
        Self::with_results(reports.into_iter().map(Ok).collect())
    }

    /// Queue reports and run errors (e.g. a timeout) in order.
    pub fn with_results(results: Vec<Result<TestReport, String>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            ..Self::default()
        }
    }

    pub fn runs(&self) -> usize {
        *self.runs.borrow()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self) -> Result<TestReport> {
        *self.runs.borrow_mut() += 1;
        let next = self.results.borrow_mut().pop_front();
        let report = match next {
            Some(Ok(report)) => report,
            Some(Err(message)) => return Err(anyhow!(message)),
            None => self.last.borrow().clone().unwrap_or_else(TestReport::not_run),
        };
        *self.last.borrow_mut() = Some(report.clone());
        Ok(report)
    }
}

pub fn test_report(passing: &[&str], failing: &[&str]) -> TestReport {
    TestReport {
        passed: passing.len() as u32,
        failed: failing.len() as u32,
        failing: failing.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        ran: true,
    }
}

// ----------------------------------------------------------------------
// Builders
// ----------------------------------------------------------------------

/// Task under `root` (or the root itself when `id == "root"`).
pub fn task(id: &str, status: TaskStatus) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: String::new(),
        status,
        priority: Priority::P1,
        blocker_reason: None,
        parent_id: (id != "root").then(|| "root".to_string()),
        blocked_by: Vec::new(),
    }
}

pub fn blocked_task(id: &str, reason: &str) -> Task {
    Task {
        blocker_reason: Some(reason.to_string()),
        ..task(id, TaskStatus::Blocked)
    }
}

/// Work claims rooted at `root`, sorting `tasks` into status buckets by id.
pub fn work_claims(mut tasks: Vec<Task>) -> WorkClaims {
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    let mut work = WorkClaims {
        root_task_id: Some("root".to_string()),
        open: Vec::new(),
        blocked: Vec::new(),
        closed: Vec::new(),
        recent_comments: Vec::new(),
        no_root_task: false,
    };
    for task in tasks {
        match task.status {
            TaskStatus::Open | TaskStatus::InProgress => work.open.push(task),
            TaskStatus::Blocked => work.blocked.push(task),
            TaskStatus::Closed => work.closed.push(task),
        }
    }
    work
}

/// Claims with the given work section and empty project and human sections.
pub fn claims_with(work: WorkClaims) -> Claims {
    Claims {
        timestamp: "2026-01-01T00:00:00Z".to_string(),
        iteration_number: 1,
        code: Section::Unavailable("not collected in tests".to_string()),
        work: Section::Collected(work),
        project: Section::Collected(ProjectClaims {
            iteration_number: 1,
            first_iteration: true,
            history: Vec::new(),
            agent_summaries: Vec::new(),
            pending_merges: Vec::new(),
            stagnation: None,
            last_failing_tests: BTreeSet::new(),
            kickstart: false,
        }),
        human: Section::Collected(HumanClaims {
            inputs: Vec::new(),
            spec_modified: false,
        }),
    }
}

/// An unsatisfied verdict with actionable work and nothing else.
pub fn verdict() -> Verdict {
    Verdict {
        spec_satisfied: SpecSatisfied::No,
        actionable_work_exists: true,
        confidence: Confidence::High,
        task_updates: Vec::new(),
        new_tasks: Vec::new(),
        gaps: Vec::new(),
        iteration_plan: IterationPlan {
            intent: "make progress".to_string(),
            tasks: Vec::new(),
            approach: "one task at a time".to_string(),
        },
        learnings: Vec::new(),
        deprecated_learnings: Vec::new(),
        summary: None,
    }
}

/// Verdict declaring the spec satisfied.
pub fn satisfied_verdict(summary: &str) -> Verdict {
    Verdict {
        spec_satisfied: SpecSatisfied::Yes,
        actionable_work_exists: false,
        summary: Some(summary.to_string()),
        ..verdict()
    }
}

/// Verdict planning `tasks` with `intent`.
pub fn planning_verdict(intent: &str, tasks: &[&str]) -> Verdict {
    let mut v = verdict();
    v.iteration_plan.intent = intent.to_string();
    v.iteration_plan.tasks = tasks.iter().map(|t| t.to_string()).collect();
    v
}

pub fn update(task_id: &str, action: TaskAction, reason: &str) -> TaskUpdate {
    TaskUpdate {
        task_id: task_id.to_string(),
        action,
        reason: reason.to_string(),
        priority: None,
        parent_id: None,
    }
}

pub fn gap(description: &str, severity: Severity) -> Gap {
    Gap {
        description: description.to_string(),
        severity,
        create_task: false,
    }
}

pub fn verdict_json(verdict: &Verdict) -> String {
    serde_json::to_string_pretty(verdict).unwrap_or_default()
}

/// Raw act output for `task_id`.
pub fn act_json(task_id: &str, status: ActStatus, summary: &str) -> String {
    let blocker_reason = (status == ActStatus::Blocked).then(|| summary.to_string());
    serde_json::to_string(&ActOutput {
        task_id: task_id.to_string(),
        status,
        summary: summary.to_string(),
        blocker_reason,
        learnings: Vec::new(),
    })
    .unwrap_or_default()
}

/// Canonical path of a file inside `root`, for assertions.
pub fn path_in(root: &Path, rel: &str) -> PathBuf {
    root.join(rel)
}
