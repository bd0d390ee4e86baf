//! SENSE: collect claims from every source of truth.
//!
//! Each section is collected on its own; a failing source degrades only its
//! section. Nothing here writes to git, the tracker, or the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::claims::{
    Claims, CodeClaims, DiffSummary, HumanClaims, IterationSummary, ProjectClaims, Section,
    WorkClaims,
};
use crate::core::learnings::{LearningsLog, referenced_paths};
use crate::core::loop_detect::{IterationSignature, LoopDetector};
use crate::core::retry::RetryPolicy;
use crate::core::task_arena::TaskArena;
use crate::core::types::{IterationOutcome, TaskStatus};
use crate::io::git::Git;
use crate::io::retry::retry_transient;
use crate::io::signal::CancelFlag;
use crate::io::store::{IterationRecord, RunRecord, Store, now_rfc3339, sha256_hex};
use crate::io::tracker::Tracker;

pub const MAX_COMMITS: usize = 50;
pub const MAX_COMMENTS: usize = 10;
pub const HISTORY_LEN: usize = 5;

/// Build manifests whose presence means the project already has a skeleton.
const MANIFESTS: [&str; 3] = ["Cargo.toml", "pyproject.toml", "package.json"];

/// Handles the collector reads from.
pub struct SenseContext<'a> {
    pub git: &'a Git,
    pub tracker: &'a dyn Tracker,
    pub store: &'a Store,
    pub spec_path: &'a Path,
    pub learnings: &'a LearningsLog,
    pub detector: LoopDetector,
    pub retry: RetryPolicy,
    pub cancel: &'a CancelFlag,
}

/// Snapshot every source for iteration `iteration_number` of `run`.
#[instrument(skip_all, fields(run_id = %run.id, iteration = iteration_number))]
pub fn collect_claims(ctx: &SenseContext<'_>, run: &RunRecord, iteration_number: u32) -> Claims {
    let claims = Claims {
        timestamp: now_rfc3339(),
        iteration_number,
        code: section("code", collect_code(ctx, run)),
        work: section("work", collect_work(ctx, run)),
        project: section("project", collect_project(ctx, run, iteration_number)),
        human: section("human", collect_human(ctx, run)),
    };
    debug!(
        degraded = claims.degraded_sections().len(),
        "claims collected"
    );
    claims
}

fn section<T>(name: &str, result: Result<T>) -> Section<T> {
    match result {
        Ok(data) => Section::Collected(data),
        Err(err) => {
            let message = format!("{err:#}");
            warn!(section = name, err = %message, "claims section unavailable");
            Section::Unavailable(message)
        }
    }
}

fn collect_code(ctx: &SenseContext<'_>, run: &RunRecord) -> Result<CodeClaims> {
    let git = ctx.git;
    let mut claims = retry_transient(&ctx.retry, "collect code claims", ctx.cancel, || {
        if !git.is_repo()? {
            return Err(anyhow!("{} is not a git repository", git.workdir().display()));
        }
        let head = if git.has_commits()? {
            git.head_sha()?
        } else {
            String::new()
        };
        let status = git.status_porcelain()?;
        let base = match run.base_commit.as_deref() {
            Some(base) if !head.is_empty() && git.commit_exists(base)? => Some(base),
            _ => None,
        };
        let (commits, files, diff) = match base {
            Some(base) => (
                git.log_since(base, MAX_COMMITS)?,
                git.files_changed_since(base)?,
                git.diff_summary_since(base)?,
            ),
            None => (Vec::new(), Vec::new(), DiffSummary::default()),
        };
        Ok(CodeClaims {
            branch: git.current_branch()?,
            head,
            staged_count: status.iter().filter(|e| e.is_staged()).count(),
            unstaged_count: status.iter().filter(|e| e.is_unstaged()).count(),
            untracked_count: status.iter().filter(|e| e.is_untracked()).count(),
            commits_since_base: commits,
            files_changed: files,
            diff_summary: diff,
            no_base_commit: base.is_none(),
            path_checks: BTreeMap::new(),
        })
    })?;
    claims.path_checks = path_checks(ctx.learnings, git.workdir());
    Ok(claims)
}

/// Existence of every path a valid learning mentions.
pub fn path_checks(learnings: &LearningsLog, root: &Path) -> BTreeMap<String, bool> {
    learnings
        .valid()
        .iter()
        .flat_map(|entry| referenced_paths(&entry.text))
        .map(|path| {
            let exists = root.join(&path).exists();
            (path, exists)
        })
        .collect()
}

fn collect_work(ctx: &SenseContext<'_>, run: &RunRecord) -> Result<WorkClaims> {
    let tasks = retry_transient(&ctx.retry, "tracker list", ctx.cancel, || ctx.tracker.list())?;
    let mut work = WorkClaims {
        root_task_id: run.root_task_id.clone(),
        open: Vec::new(),
        blocked: Vec::new(),
        closed: Vec::new(),
        recent_comments: Vec::new(),
        no_root_task: true,
    };
    let Some(root_id) = run.root_task_id.as_deref() else {
        return Ok(work);
    };
    let arena = TaskArena::from_tasks(tasks);
    if !arena.contains(root_id) {
        warn!(root_id, "root task missing from tracker");
        return Ok(work);
    }
    work.no_root_task = false;

    for task in arena.descendants(root_id) {
        match task.status {
            TaskStatus::Open | TaskStatus::InProgress => work.open.push(task.clone()),
            TaskStatus::Blocked => work.blocked.push(task.clone()),
            TaskStatus::Closed => work.closed.push(task.clone()),
        }
    }

    let mut comments = Vec::new();
    for task in work.open.iter().chain(work.blocked.iter()) {
        let task_comments = retry_transient(&ctx.retry, "tracker comments", ctx.cancel, || {
            ctx.tracker.comments(&task.id)
        })?;
        comments.extend(task_comments);
    }
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let skip = comments.len().saturating_sub(MAX_COMMENTS);
    work.recent_comments = comments.into_iter().skip(skip).collect();
    Ok(work)
}

fn collect_project(
    ctx: &SenseContext<'_>,
    run: &RunRecord,
    iteration_number: u32,
) -> Result<ProjectClaims> {
    let limit = ctx.detector.window.max(HISTORY_LEN) + 1;
    let finished: Vec<IterationRecord> = ctx
        .store
        .recent_iterations(&run.id, limit)?
        .into_iter()
        .filter(|it| it.number < iteration_number && it.outcome != IterationOutcome::Incomplete)
        .collect();

    let signatures: Vec<IterationSignature> = finished
        .iter()
        .map(|it| IterationSignature {
            number: it.number,
            intent: it.intent.clone(),
            open_tasks: it.open_tasks,
            failing_tests: it.failing_tests.clone(),
        })
        .collect();
    let stagnation = ctx.detector.detect(&signatures);
    if let Some(flag) = &stagnation {
        warn!(message = %flag.message, "stagnation detected");
    }

    let skip = finished.len().saturating_sub(HISTORY_LEN);
    let history = finished
        .iter()
        .skip(skip)
        .map(|it| IterationSummary {
            number: it.number,
            intent: it.intent.clone(),
            outcome: it.outcome,
            open_tasks: it.open_tasks,
        })
        .collect();

    Ok(ProjectClaims {
        iteration_number,
        first_iteration: iteration_number == 1,
        history,
        agent_summaries: ctx.store.recent_summaries(&run.id, HISTORY_LEN)?,
        pending_merges: ctx
            .store
            .pending_merges(&run.id)?
            .into_iter()
            .map(|stored| stored.merge)
            .collect(),
        stagnation,
        last_failing_tests: finished
            .last()
            .map(|it| it.failing_tests.clone())
            .unwrap_or_default(),
        kickstart: is_kickstart(ctx.git.workdir()),
    })
}

/// True when `root` has neither a build manifest nor a `src/` directory.
pub fn is_kickstart(root: &Path) -> bool {
    let has_manifest = MANIFESTS.iter().any(|name| root.join(name).is_file());
    !has_manifest && !root.join("src").is_dir()
}

fn collect_human(ctx: &SenseContext<'_>, run: &RunRecord) -> Result<HumanClaims> {
    let inputs = ctx.store.pending_inputs(&run.id)?;
    let current = fs::read_to_string(ctx.spec_path)
        .with_context(|| format!("read spec {}", ctx.spec_path.display()))?;
    let spec_modified = match ctx.store.latest_spec(&run.id)? {
        Some((_, sha)) => sha != sha256_hex(&current),
        None => true,
    };
    Ok(HumanClaims {
        inputs,
        spec_modified,
    })
}
