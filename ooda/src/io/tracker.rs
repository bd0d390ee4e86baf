//! Work tracker abstraction and the `trc` CLI backend.
//!
//! The [`Tracker`] trait decouples reconciliation and act from the task CLI.
//! Tests use an in-memory tracker from `test_support`.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::{Priority, Task, TaskComment, TaskStatus};
use crate::io::process::run_command_with_timeout;

const TRACKER_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// Fields for a task about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub parent_id: Option<String>,
    pub priority: Priority,
}

/// A partial update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskChange {
    pub status: Option<TaskStatus>,
    pub reason: Option<String>,
    pub priority: Option<Priority>,
    pub parent_id: Option<String>,
}

pub trait Tracker {
    /// Every task the tracker knows, in any order.
    fn list(&self) -> Result<Vec<Task>>;
    /// Create a task and return its id.
    fn create(&self, draft: &TaskDraft) -> Result<String>;
    fn close(&self, task_id: &str, message: &str) -> Result<()>;
    fn update(&self, task_id: &str, change: &TaskChange) -> Result<()>;
    fn comment(&self, task_id: &str, text: &str) -> Result<()>;
    fn comments(&self, task_id: &str) -> Result<Vec<TaskComment>>;
}

/// Tracker backed by an external CLI (default `trc`).
#[derive(Debug, Clone)]
pub struct CliTracker {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CliTracker {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
        }
    }

    fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("tracker command is empty"))?;
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let label = format!("{program} {}", args.first().map(String::as_str).unwrap_or(""));
        let mut cmd = Command::new(program);
        cmd.args(prefix).args(&args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, TRACKER_OUTPUT_LIMIT)
            .with_context(|| format!("run {label}"))?;
        if !output.success() {
            return Err(anyhow!(output.failure_message(label.trim(), self.timeout)));
        }
        Ok(output.stdout_text())
    }
}

impl Tracker for CliTracker {
    #[instrument(skip_all)]
    fn list(&self) -> Result<Vec<Task>> {
        let stdout = self.run(["list", "--all", "--json"])?;
        let tasks = parse_task_list(&stdout)?;
        debug!(count = tasks.len(), "tracker listed tasks");
        Ok(tasks)
    }

    #[instrument(skip_all, fields(title = %draft.title))]
    fn create(&self, draft: &TaskDraft) -> Result<String> {
        let mut args = vec![
            "create".to_string(),
            draft.title.clone(),
            "--description".to_string(),
            draft.description.clone(),
        ];
        if let Some(parent) = &draft.parent_id {
            args.push("--parent".to_string());
            args.push(parent.clone());
        }
        args.push("--priority".to_string());
        args.push(u8::from(draft.priority).to_string());
        args.push("--json".to_string());
        let stdout = self.run(args)?;
        let created: CreatedTask = serde_json::from_str(stdout.trim())
            .with_context(|| format!("parse tracker create output: {}", stdout.trim()))?;
        debug!(task_id = %created.id, "tracker created task");
        Ok(created.id)
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    fn close(&self, task_id: &str, message: &str) -> Result<()> {
        self.run(["close", task_id, "--message", message])?;
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    fn update(&self, task_id: &str, change: &TaskChange) -> Result<()> {
        let mut args = vec!["update".to_string(), task_id.to_string()];
        if let Some(status) = change.status {
            args.push("--status".to_string());
            args.push(status.as_str().to_string());
        }
        if let Some(reason) = &change.reason {
            args.push("--reason".to_string());
            args.push(reason.clone());
        }
        if let Some(priority) = change.priority {
            args.push("--priority".to_string());
            args.push(u8::from(priority).to_string());
        }
        if let Some(parent) = &change.parent_id {
            args.push("--parent".to_string());
            args.push(parent.clone());
        }
        self.run(args)?;
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    fn comment(&self, task_id: &str, text: &str) -> Result<()> {
        self.run(["comment", task_id, text, "--source", "ooda"])?;
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    fn comments(&self, task_id: &str) -> Result<Vec<TaskComment>> {
        let stdout = self.run(["comments", task_id, "--json"])?;
        parse_comments(task_id, &stdout)
    }
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    id: String,
}

/// Task as printed by the tracker CLI. Field names vary slightly across versions.
#[derive(Debug, Deserialize)]
struct WireTask {
    id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    status: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default, alias = "reason", alias = "blocked_reason")]
    blocker_reason: Option<String>,
    #[serde(default, alias = "parent")]
    parent_id: Option<String>,
    #[serde(default, alias = "depends_on")]
    blocked_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    #[serde(alias = "body")]
    text: String,
    #[serde(default, alias = "author")]
    source: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "open" | "todo" | "ready" => Ok(TaskStatus::Open),
        "in_progress" | "active" => Ok(TaskStatus::InProgress),
        "closed" | "done" | "completed" => Ok(TaskStatus::Closed),
        "blocked" => Ok(TaskStatus::Blocked),
        other => Err(anyhow!("unknown tracker status '{other}'")),
    }
}

/// Parse `list --all --json` output.
pub fn parse_task_list(stdout: &str) -> Result<Vec<Task>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let wire: Vec<WireTask> =
        serde_json::from_str(trimmed).context("parse tracker task list")?;
    wire.into_iter()
        .map(|task| {
            let status = parse_status(&task.status)
                .with_context(|| format!("task '{}'", task.id))?;
            let priority = match task.priority {
                Some(raw) => Priority::try_from(raw)
                    .map_err(|err| anyhow!("task '{}': {err}", task.id))?,
                None => Priority::default(),
            };
            let blocker_reason = task
                .blocker_reason
                .filter(|reason| status == TaskStatus::Blocked && !reason.trim().is_empty());
            Ok(Task {
                id: task.id,
                title: task.title,
                description: task.description.unwrap_or_default(),
                status,
                priority,
                blocker_reason,
                parent_id: task.parent_id.filter(|p| !p.is_empty()),
                blocked_by: task.blocked_by,
            })
        })
        .collect()
}

/// Parse `comments <id> --json` output.
pub fn parse_comments(task_id: &str, stdout: &str) -> Result<Vec<TaskComment>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let wire: Vec<WireComment> = serde_json::from_str(trimmed)
        .with_context(|| format!("parse tracker comments for {task_id}"))?;
    Ok(wire
        .into_iter()
        .map(|comment| TaskComment {
            task_id: task_id.to_string(),
            text: comment.text,
            source: comment.source.unwrap_or_default(),
            created_at: comment.created_at.unwrap_or_default(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_task_list_maps_wire_fields() {
        let raw = r#"[
            {"id": "t1", "title": "Root", "status": "open"},
            {"id": "t2", "title": "Login", "status": "blocked", "priority": 0,
             "reason": "depends on t3", "parent": "t1", "depends_on": ["t3"]},
            {"id": "t3", "title": "Schema", "status": "done", "parent_id": "t1",
             "reason": "stale"}
        ]"#;
        let tasks = parse_task_list(raw).expect("parse");
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].priority, Priority::P1);
        assert_eq!(tasks[1].status, TaskStatus::Blocked);
        assert_eq!(tasks[1].blocker_reason.as_deref(), Some("depends on t3"));
        assert_eq!(tasks[1].blocked_by, vec!["t3".to_string()]);
        assert_eq!(tasks[1].parent_id.as_deref(), Some("t1"));
        assert_eq!(tasks[2].status, TaskStatus::Closed);
        assert!(tasks[2].blocker_reason.is_none());
    }

    #[test]
    fn parse_task_list_rejects_unknown_status() {
        let err = parse_task_list(r#"[{"id":"t1","title":"x","status":"weird"}]"#).unwrap_err();
        assert!(format!("{err:#}").contains("unknown tracker status"));
    }

    #[test]
    fn parse_comments_fills_task_id() {
        let comments =
            parse_comments("t1", r#"[{"body": "Verified closed: ok", "author": "ooda"}]"#)
                .expect("parse");
        assert_eq!(comments[0].task_id, "t1");
        assert_eq!(comments[0].source, "ooda");
        assert!(parse_comments("t1", "  ").expect("empty").is_empty());
    }

    /// A failing CLI surfaces the last stderr line for classification.
    #[test]
    fn cli_failure_reports_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = CliTracker::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'HTTP 503 unavailable' >&2; exit 1".to_string(),
                "trc".to_string(),
            ],
            temp.path(),
            Duration::from_secs(5),
        );
        let err = tracker.list().unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn cli_list_parses_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = CliTracker::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"printf '[{"id":"a","title":"A","status":"open"}]'"#.to_string(),
                "trc".to_string(),
            ],
            temp.path(),
            Duration::from_secs(5),
        );
        let tasks = tracker.list().expect("list");
        assert_eq!(tasks[0].id, "a");
    }
}
