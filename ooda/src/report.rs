//! Read-only views of stored runs: `ooda status`, `ooda history`, and the
//! markdown summary written when a run stops.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::core::summary::{BlockedTask, RunSummary, render_summary, spec_title};
use crate::io::config::write_atomic;
use crate::io::learnings_store::load_learnings;
use crate::io::paths::OodaPaths;
use crate::io::store::{RunRecord, Store, now_rfc3339};

const STATUS_ITERATIONS: usize = 5;

/// Assemble the summary of `run_id` from the store and the learnings log.
pub fn build_summary(paths: &OodaPaths, store: &Store, run_id: &str) -> Result<RunSummary> {
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("unknown run '{run_id}'"))?;
    let spec = store
        .latest_spec(run_id)?
        .map(|(content, _)| content)
        .unwrap_or_else(|| run.spec_content.clone());
    let outcomes = store.task_outcomes(run_id)?;
    let learnings = load_learnings(&paths.learnings_log_path)?
        .valid()
        .into_iter()
        .map(|entry| entry.text)
        .collect();
    Ok(RunSummary {
        run_id: run.id.clone(),
        status: run.status,
        detail: run.stop_reason.clone(),
        iterations: store.iteration_count(run_id)?,
        spec_title: spec_title(&spec).unwrap_or_else(|| fallback_title(&run.spec_path)),
        completed_at: run.ended_at.clone().unwrap_or_else(now_rfc3339),
        milestone_branch: run.milestone_branch.clone(),
        tasks_completed: outcomes.completed,
        tasks_blocked: outcomes
            .blocked
            .into_iter()
            .map(|(task_id, reason)| BlockedTask { task_id, reason })
            .collect(),
        learnings,
    })
}

/// Render and atomically write `summaries/<run>.md`.
pub fn write_summary(paths: &OodaPaths, store: &Store, run_id: &str) -> Result<PathBuf> {
    let summary = build_summary(paths, store, run_id)?;
    let path = paths.summary_path(run_id);
    write_atomic(&path, &render_summary(&summary))
        .with_context(|| format!("write summary for {run_id}"))?;
    info!(run_id, path = %path.display(), "run summary written");
    Ok(path)
}

/// Title used when a spec has no `# ` heading.
pub fn fallback_title(spec_path: &str) -> String {
    let name = Path::new(spec_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| spec_path.to_string());
    format!("Milestone: {name}")
}

/// Latest run plus its most recent iterations.
pub fn render_status(store: &Store) -> Result<String> {
    let Some(run) = store.latest_run()? else {
        return Ok("No runs recorded.\n".to_string());
    };
    let mut out = String::new();
    write_run_header(&mut out, &run, store.iteration_count(&run.id)?);

    let iterations = store.recent_iterations(&run.id, STATUS_ITERATIONS)?;
    if iterations.is_empty() {
        out.push_str("\nNo iterations yet.\n");
        return Ok(out);
    }
    out.push_str("\nRecent iterations:\n");
    for iteration in iterations {
        let open = iteration
            .open_tasks
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        let _ = writeln!(
            out,
            "  #{:<3} {:<10} open={:<3} failing={:<3} {}",
            iteration.number,
            iteration.outcome.as_str(),
            open,
            iteration.failing_tests.len(),
            iteration.intent
        );
    }
    let pending = store.pending_merges(&run.id)?;
    if !pending.is_empty() {
        out.push_str("\nPending merges:\n");
        for stored in pending {
            let _ = writeln!(
                out,
                "  {} (iteration {}): {}",
                stored.merge.branch,
                stored.merge.iteration,
                stored.merge.conflicts.join(", ")
            );
        }
    }
    Ok(out)
}

/// One line per run, newest first.
pub fn render_history(store: &Store, limit: usize) -> Result<String> {
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        return Ok("No runs recorded.\n".to_string());
    }
    let mut out = String::new();
    for run in runs {
        let iterations = store.iteration_count(&run.id)?;
        let _ = writeln!(
            out,
            "{}  {:<14} iterations={:<3} started={}  {}",
            run.id,
            run.status.as_str(),
            iterations,
            run.started_at,
            run.stop_reason.as_deref().unwrap_or("")
        );
    }
    Ok(out)
}

fn write_run_header(out: &mut String, run: &RunRecord, iterations: u32) {
    let _ = writeln!(out, "Run {} ({})", run.id, run.status.as_str());
    let _ = writeln!(out, "  spec:       {}", run.spec_path);
    if let Some(branch) = &run.milestone_branch {
        let _ = writeln!(out, "  milestone:  {branch}");
    }
    let _ = writeln!(out, "  started:    {}", run.started_at);
    if let Some(ended) = &run.ended_at {
        let _ = writeln!(out, "  ended:      {ended}");
    }
    let _ = writeln!(out, "  iterations: {iterations}");
    if let Some(reason) = &run.stop_reason {
        let _ = writeln!(out, "  reason:     {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{IterationOutcome, RunStatus};
    use crate::io::paths::ensure_layout;
    use crate::io::store::{ActCheckpoint, NewRun};

    fn store_with_run(id: &str) -> Store {
        let store = Store::open_in_memory().expect("store");
        store
            .create_run(&NewRun {
                id,
                spec_path: "docs/SPEC.md",
                spec_content: "intro\n# Todo API\n",
                root_task_id: "root",
                milestone_branch: "ooda/milestone-todo-api",
                base_commit: "abc",
            })
            .expect("run");
        store
    }

    #[test]
    fn status_without_runs() {
        let store = Store::open_in_memory().expect("store");
        assert_eq!(render_status(&store).expect("status"), "No runs recorded.\n");
        assert_eq!(render_history(&store, 5).expect("history"), "No runs recorded.\n");
    }

    #[test]
    fn status_lists_recent_iterations() {
        let store = store_with_run("run-1");
        for number in 1..=7 {
            let iteration = store.start_iteration("run-1", number).expect("iteration");
            store
                .set_iteration_plan(iteration.id, &format!("step {number}"), Some(3))
                .expect("plan");
            store
                .finish_iteration(iteration.id, IterationOutcome::Continue)
                .expect("finish");
        }
        let text = render_status(&store).expect("status");
        assert!(text.starts_with("Run run-1 (running)"));
        assert!(text.contains("iterations: 7"));
        assert!(!text.contains("step 2"));
        assert!(text.contains("step 3"));
        assert!(text.contains("#7"));
    }

    #[test]
    fn history_shows_stop_reason() {
        let store = store_with_run("run-1");
        store
            .set_run_status("run-1", RunStatus::Stuck, Some("waiting on API key"))
            .expect("status");
        let text = render_history(&store, 10).expect("history");
        assert!(text.contains("run-1"));
        assert!(text.contains("stuck"));
        assert!(text.contains("waiting on API key"));
    }

    #[test]
    fn summary_collects_task_outcomes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ensure_layout(temp.path()).expect("layout");
        let store = store_with_run("run-1");
        let iteration = store.start_iteration("run-1", 1).expect("iteration");
        for (task, state, detail) in [
            ("t1", "committed", "added listing"),
            ("t2", "blocked", "failing tests: api::delete"),
        ] {
            store
                .checkpoint(
                    iteration.id,
                    &ActCheckpoint {
                        task_id: Some(task.to_string()),
                        state: state.to_string(),
                        detail: detail.to_string(),
                        commit_sha: None,
                    },
                )
                .expect("checkpoint");
        }
        store
            .set_run_status("run-1", RunStatus::Stuck, Some("t2 is blocked"))
            .expect("status");

        let path = write_summary(&paths, &store, "run-1").expect("summary");
        let text = std::fs::read_to_string(path).expect("read");
        assert!(text.contains("Todo API"));
        assert!(text.contains("- t1"));
        assert!(text.contains("- t2: failing tests: api::delete"));
        assert!(text.contains("t2 is blocked"));
    }

    #[test]
    fn fallback_title_uses_file_name() {
        assert_eq!(fallback_title("docs/SPEC.md"), "Milestone: SPEC.md");
    }
}
