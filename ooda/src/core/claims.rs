//! Claims: unverified state snapshots reported by each source of truth.
//!
//! A `Claims` value is recomputed every iteration and never persisted. Each
//! section is collected independently; a failing source yields
//! [`Section::Unavailable`] instead of aborting collection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::loop_detect::StagnationFlag;
use crate::core::types::{HumanInputKind, IterationOutcome, Task, TaskComment, TaskStatus};

/// Outcome of collecting one claims section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section<T> {
    Collected(T),
    Unavailable(String),
}

impl<T> Section<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Collected(data) => Some(data),
            Self::Unavailable(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Collected(_) => None,
            Self::Unavailable(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub subject: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files_changed: u32,
    pub lines_added: u64,
    pub lines_removed: u64,
}

/// What version control reports, scoped to the run's base commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeClaims {
    pub branch: String,
    pub head: String,
    pub staged_count: usize,
    pub unstaged_count: usize,
    pub untracked_count: usize,
    pub commits_since_base: Vec<CommitInfo>,
    pub files_changed: Vec<String>,
    pub diff_summary: DiffSummary,
    pub no_base_commit: bool,
    /// Existence of every path referenced by a currently valid learning.
    pub path_checks: BTreeMap<String, bool>,
}

/// What the work tracker reports for the run's task tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkClaims {
    pub root_task_id: Option<String>,
    pub open: Vec<Task>,
    pub blocked: Vec<Task>,
    pub closed: Vec<Task>,
    pub recent_comments: Vec<TaskComment>,
    pub no_root_task: bool,
}

impl WorkClaims {
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.open
            .iter()
            .chain(self.blocked.iter())
            .chain(self.closed.iter())
    }

    pub fn find(&self, task_id: &str) -> Option<&Task> {
        self.all_tasks().find(|task| task.id == task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.find(task_id).map(|task| task.status)
    }

    /// Count of open (non-blocked, non-closed) tasks, the root excluded.
    pub fn open_count(&self) -> usize {
        self.open
            .iter()
            .filter(|task| Some(&task.id) != self.root_task_id.as_ref())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub number: u32,
    pub intent: String,
    pub outcome: IterationOutcome,
    pub open_tasks: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMerge {
    pub branch: String,
    pub iteration: u32,
    pub reason: String,
    pub conflicts: Vec<String>,
}

/// What the run store reports about this run's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectClaims {
    pub iteration_number: u32,
    pub first_iteration: bool,
    pub history: Vec<IterationSummary>,
    pub agent_summaries: Vec<String>,
    pub pending_merges: Vec<PendingMerge>,
    pub stagnation: Option<StagnationFlag>,
    /// Failures the most recent act phase introduced over its baseline.
    pub last_failing_tests: BTreeSet<String>,
    /// No build manifest and no `src/` directory: the project starts from scratch.
    #[serde(default)]
    pub kickstart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanInput {
    pub id: i64,
    pub kind: HumanInputKind,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanClaims {
    pub inputs: Vec<HumanInput>,
    pub spec_modified: bool,
}

impl HumanClaims {
    pub fn has(&self, kind: HumanInputKind) -> bool {
        self.inputs.iter().any(|input| input.kind == kind)
    }
}

/// Timestamped aggregation of every source's report for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub timestamp: String,
    pub iteration_number: u32,
    pub code: Section<CodeClaims>,
    pub work: Section<WorkClaims>,
    pub project: Section<ProjectClaims>,
    pub human: Section<HumanClaims>,
}

impl Claims {
    /// True when both snapshots report the same state, ignoring the timestamp.
    pub fn same_state(&self, other: &Claims) -> bool {
        self.iteration_number == other.iteration_number
            && self.code == other.code
            && self.work == other.work
            && self.project == other.project
            && self.human == other.human
    }

    pub fn work(&self) -> Option<&WorkClaims> {
        self.work.data()
    }

    pub fn pending_merges(&self) -> &[PendingMerge] {
        self.project
            .data()
            .map(|project| project.pending_merges.as_slice())
            .unwrap_or_default()
    }

    pub fn stagnation(&self) -> Option<&StagnationFlag> {
        self.project
            .data()
            .and_then(|project| project.stagnation.as_ref())
    }

    pub fn kickstart(&self) -> bool {
        self.project.data().is_some_and(|project| project.kickstart)
    }

    /// Sections that failed to collect, as `(name, error)` pairs.
    pub fn degraded_sections(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(err) = self.code.error() {
            out.push(("code", err));
        }
        if let Some(err) = self.work.error() {
            out.push(("work", err));
        }
        if let Some(err) = self.project.error() {
            out.push(("project", err));
        }
        if let Some(err) = self.human.error() {
            out.push(("human", err));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Priority;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: format!("{id} title"),
            description: String::new(),
            status,
            priority: Priority::P1,
            blocker_reason: None,
            parent_id: Some("root".to_string()),
            blocked_by: Vec::new(),
        }
    }

    fn claims(timestamp: &str) -> Claims {
        Claims {
            timestamp: timestamp.to_string(),
            iteration_number: 1,
            code: Section::Unavailable("not a git repository".to_string()),
            work: Section::Collected(WorkClaims {
                root_task_id: Some("root".to_string()),
                open: vec![task("root", TaskStatus::Open), task("t1", TaskStatus::Open)],
                blocked: Vec::new(),
                closed: vec![task("t0", TaskStatus::Closed)],
                recent_comments: Vec::new(),
                no_root_task: false,
            }),
            project: Section::Unavailable("db locked".to_string()),
            human: Section::Collected(HumanClaims {
                inputs: Vec::new(),
                spec_modified: false,
            }),
        }
    }

    #[test]
    fn same_state_ignores_timestamp() {
        let a = claims("2026-01-01T00:00:00Z");
        let b = claims("2026-01-01T00:00:05Z");
        assert_ne!(a, b);
        assert!(a.same_state(&b));
    }

    #[test]
    fn open_count_excludes_root() {
        let c = claims("t");
        assert_eq!(c.work().expect("work").open_count(), 1);
        assert_eq!(
            c.work().expect("work").status_of("t0"),
            Some(TaskStatus::Closed)
        );
    }

    #[test]
    fn degraded_sections_lists_failures() {
        let c = claims("t");
        let degraded = c.degraded_sections();
        assert_eq!(
            degraded,
            vec![("code", "not a git repository"), ("project", "db locked")]
        );
        assert!(c.pending_merges().is_empty());
    }
}
