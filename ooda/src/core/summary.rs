//! Markdown summary written when a run stops.

use crate::core::types::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// STUCK reason, DONE summary, or other stop detail.
    pub detail: Option<String>,
    pub iterations: u32,
    pub spec_title: String,
    pub completed_at: String,
    pub milestone_branch: Option<String>,
    pub tasks_completed: Vec<String>,
    pub tasks_blocked: Vec<BlockedTask>,
    pub learnings: Vec<String>,
}

/// Text of the first `# ` heading in a spec document.
pub fn spec_title(spec: &str) -> Option<String> {
    spec.lines()
        .filter_map(|line| line.trim_start().strip_prefix("# "))
        .map(str::trim)
        .find(|title| !title.is_empty())
        .map(str::to_string)
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# ooda run summary".to_string(),
        String::new(),
        format!("**Run:** {}", summary.run_id),
        format!("**Iterations:** {}", summary.iterations),
        format!("**Finished:** {}", summary.completed_at),
        String::new(),
        "## Spec".to_string(),
        summary.spec_title.clone(),
        String::new(),
        "## Outcome".to_string(),
        format!("Status: {}", summary.status.as_str()),
    ];
    if let Some(detail) = summary.detail.as_deref().filter(|d| !d.trim().is_empty()) {
        lines.push(detail.trim().to_string());
    }
    lines.push(String::new());

    lines.push("## Tasks Completed".to_string());
    if summary.tasks_completed.is_empty() {
        lines.push("_None_".to_string());
    }
    for task in &summary.tasks_completed {
        lines.push(format!("- {task}"));
    }
    lines.push(String::new());

    lines.push("## Tasks Blocked".to_string());
    if summary.tasks_blocked.is_empty() {
        lines.push("_None_".to_string());
    }
    for blocked in &summary.tasks_blocked {
        lines.push(format!("- {}: {}", blocked.task_id, blocked.reason));
    }
    lines.push(String::new());

    lines.push("## Learnings".to_string());
    if summary.learnings.is_empty() {
        lines.push("_None_".to_string());
    }
    for learning in &summary.learnings {
        lines.push(format!("- {learning}"));
    }
    lines.push(String::new());

    lines.push("## Next Steps".to_string());
    match summary.status {
        RunStatus::Completed => match &summary.milestone_branch {
            Some(branch) => {
                lines.push(format!("1. Review changes on branch `{branch}`"));
                lines.push(format!("2. Open a pull request from `{branch}`"));
            }
            None => lines.push("1. Review the changes made during this run".to_string()),
        },
        RunStatus::Aborted => {
            lines.push("1. Inspect the partial work; start a new run when ready".to_string());
        }
        RunStatus::Running | RunStatus::Stuck | RunStatus::MaxIterations => {
            lines.push("1. Review the blocked tasks above".to_string());
            lines.push("2. Address the blockers or add guidance with `ooda input`".to_string());
            lines.push("3. Continue with `ooda resume`".to_string());
        }
    }
    lines.push(String::new());
    lines.join("\n")
}
