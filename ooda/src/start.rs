//! Orchestration for starting and resuming a run.
//!
//! A "run" drives one spec file toward DONE. Starting a run: checks the repo
//! is clean apart from the spec, commits the spec, creates the root task in
//! the tracker, and checks out `<prefix>/milestone-<slug>`. Iteration
//! branches are cut from and merged back into that milestone branch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::summary::spec_title;
use crate::core::types::{Priority, RunStatus};
use crate::io::config::OodaConfig;
use crate::io::git::Git;
use crate::io::paths::OodaPaths;
use crate::io::retry::retry_transient;
use crate::io::signal::CancelFlag;
use crate::io::store::{NewRun, RunRecord, Store};
use crate::io::tracker::{TaskDraft, Tracker};
use crate::report::fallback_title;

const DESCRIPTION_LINES: usize = 10;
const SLUG_MAX: usize = 40;

pub struct StartContext<'a> {
    pub paths: &'a OodaPaths,
    pub config: &'a OodaConfig,
    pub git: &'a Git,
    pub tracker: &'a dyn Tracker,
    pub store: &'a Store,
    pub cancel: &'a CancelFlag,
}

/// Start a new run for `spec` (defaults to `config.spec_path`).
///
/// Any run still marked running is superseded and marked aborted.
#[instrument(skip_all)]
pub fn start_run(ctx: &StartContext<'_>, spec: Option<&Path>) -> Result<RunRecord> {
    let git = ctx.git;
    let root = &ctx.paths.root;
    if !git.is_repo()? {
        bail!("{} is not a git repository", root.display());
    }

    let spec_rel = spec_relative(root, spec.unwrap_or(Path::new(&ctx.config.spec_path)));
    let spec_abs = root.join(&spec_rel);
    let spec_content = fs::read_to_string(&spec_abs)
        .with_context(|| format!("read spec {}", spec_abs.display()))?;
    if spec_content.trim().is_empty() {
        bail!("spec file {} is empty", spec_abs.display());
    }
    let spec_rel_str = spec_rel.to_string_lossy().replace('\\', "/");

    if !git.has_commits()? {
        info!("repository has no commits; creating an initial commit");
        git.commit_empty("chore: initialize repository")?;
    }
    let dirty: Vec<String> = git
        .status_porcelain()?
        .into_iter()
        .map(|entry| entry.path)
        .filter(|path| path != &spec_rel_str)
        .collect();
    if !dirty.is_empty() {
        bail!(
            "working tree has uncommitted changes outside the spec ({}); commit or stash them first",
            dirty.join(", ")
        );
    }

    let run_id = generate_run_id(ctx.store, Utc::now())?;
    if let Some(previous) = ctx.store.latest_running_run()? {
        warn!(run_id = %previous.id, "superseding unfinished run");
        ctx.store.set_run_status(
            &previous.id,
            RunStatus::Aborted,
            Some(&format!("superseded by run {run_id}")),
        )?;
    }

    let title = spec_title(&spec_content).unwrap_or_else(|| fallback_title(&spec_rel_str));
    let draft = TaskDraft {
        title: title.clone(),
        description: root_description(&spec_content),
        parent_id: None,
        priority: Priority::P1,
    };
    let root_task_id = retry_transient(&ctx.config.retry.policy(), "tracker create", ctx.cancel, || {
        ctx.tracker.create(&draft)
    })
    .context("create root task")?;
    debug!(task_id = %root_task_id, "root task created");

    let milestone = git.unique_branch_name(&format!(
        "{}/milestone-{}",
        ctx.config.branch_prefix,
        slugify(&title)
    ))?;
    git.checkout_new_branch(&milestone)
        .with_context(|| format!("create branch {milestone}"))?;
    git.add_all()?;
    git.commit_staged(&format!("chore(ooda): start run {run_id}"))?;
    let base_commit = git.head_sha()?;

    let run = ctx.store.create_run(&NewRun {
        id: &run_id,
        spec_path: &spec_rel_str,
        spec_content: &spec_content,
        root_task_id: &root_task_id,
        milestone_branch: &milestone,
        base_commit: &base_commit,
    })?;
    info!(run_id = %run.id, branch = %milestone, root_task = %root_task_id, "run started");
    Ok(run)
}

/// Pick the run to resume: `run_id`, or the latest unfinished one.
///
/// A run stopped by the iteration limit is set back to running.
pub fn resume_run(store: &Store, git: &Git, run_id: Option<&str>) -> Result<RunRecord> {
    let run = match run_id {
        Some(id) => store
            .get_run(id)?
            .ok_or_else(|| anyhow!("unknown run '{id}'"))?,
        None => match store.latest_running_run()? {
            Some(run) => run,
            None => store
                .latest_run()?
                .filter(|run| run.status == RunStatus::MaxIterations)
                .ok_or_else(|| anyhow!("no resumable run (start one with `ooda run`)"))?,
        },
    };
    match run.status {
        RunStatus::Running => {}
        RunStatus::MaxIterations => store.set_run_status(&run.id, RunStatus::Running, None)?,
        other => bail!("run {} is {} and cannot be resumed", run.id, other.as_str()),
    }
    if let Some(milestone) = &run.milestone_branch
        && store.open_iteration(&run.id)?.is_none()
        && git.current_branch()? != *milestone
    {
        git.checkout_branch(milestone)?;
    }
    info!(run_id = %run.id, "resuming run");
    store
        .get_run(&run.id)?
        .ok_or_else(|| anyhow!("run {} vanished", run.id))
}

/// `run-YYYYMMDD-HHMMSS`, suffixed `-2`, `-3`, ... when taken.
pub fn generate_run_id(store: &Store, now: DateTime<Utc>) -> Result<String> {
    let base = format!("run-{}", now.format("%Y%m%d-%H%M%S"));
    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !store.run_exists(&id)? {
            return Ok(id);
        }
    }
    Err(anyhow!("unable to generate unique run id from base '{base}'"))
}

fn spec_relative(root: &Path, spec: &Path) -> PathBuf {
    spec.strip_prefix(root).unwrap_or(spec).to_path_buf()
}

fn root_description(spec: &str) -> String {
    spec.lines()
        .take(DESCRIPTION_LINES)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lowercase ASCII words joined by `-`, at most 40 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(SLUG_MAX);
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "spec".to_string()
    } else {
        slug.to_string()
    }
}
