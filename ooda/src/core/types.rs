//! Shared deterministic types for the control plane.
//!
//! These types define the contracts between phases (verdict, decision, task
//! mirror, act output). They do not depend on external state or I/O, and their
//! serialized form is stable so that a validated verdict re-serializes to the
//! same bytes.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Whether the reasoner judged the spec satisfied.
///
/// Serialized as `true`, `false`, or the string `"unverifiable"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SpecSatisfiedRepr", into = "SpecSatisfiedRepr")]
pub enum SpecSatisfied {
    Yes,
    No,
    Unverifiable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SpecSatisfiedRepr {
    Flag(bool),
    Text(String),
}

impl TryFrom<SpecSatisfiedRepr> for SpecSatisfied {
    type Error = String;

    fn try_from(value: SpecSatisfiedRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            SpecSatisfiedRepr::Flag(true) => Ok(Self::Yes),
            SpecSatisfiedRepr::Flag(false) => Ok(Self::No),
            SpecSatisfiedRepr::Text(text) if text == "unverifiable" => Ok(Self::Unverifiable),
            SpecSatisfiedRepr::Text(text) => Err(format!(
                "spec_satisfied must be true, false or \"unverifiable\" (got \"{text}\")"
            )),
        }
    }
}

impl From<SpecSatisfied> for SpecSatisfiedRepr {
    fn from(value: SpecSatisfied) -> Self {
        match value {
            SpecSatisfied::Yes => Self::Flag(true),
            SpecSatisfied::No => Self::Flag(false),
            SpecSatisfied::Unverifiable => Self::Text("unverifiable".to_string()),
        }
    }
}

impl fmt::Display for SpecSatisfied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yes => f.write_str("true"),
            Self::No => f.write_str("false"),
            Self::Unverifiable => f.write_str("unverifiable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Task priority. P0 is the most urgent; serialized as `0`, `1`, `2`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    P0,
    #[default]
    P1,
    P2,
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::P0),
            1 => Ok(Self::P1),
            2 => Ok(Self::P2),
            other => Err(format!("priority must be 0, 1 or 2 (got {other})")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        match value {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", u8::from(*self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Blocked => "blocked",
        }
    }

    /// True for tasks that still represent outstanding work.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::InProgress | Self::Blocked)
    }
}

/// Mirror of one work item held by the external tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Ids of tasks this one waits on (tracker-level dependency).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

/// A tracker comment attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskComment {
    pub task_id: String,
    pub text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Close,
    Update,
    Block,
    Unblock,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Update => "update",
            Self::Block => "block",
            Self::Unblock => "unblock",
        }
    }
}

/// Instruction to change an existing task.
///
/// For `close`, `reason` carries the observed-in-code proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskUpdate {
    pub task_id: String,
    pub action: TaskAction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// New parent for an `update` that moves the task in the tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Important,
    Minor,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Important => "important",
            Self::Minor => "minor",
        }
    }
}

/// Discrepancy between the spec and observed reality. Lives for one verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Gap {
    pub description: String,
    pub severity: Severity,
    /// Explicit request to track a minor gap as a task.
    #[serde(default, skip_serializing_if = "is_false")]
    pub create_task: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IterationPlan {
    pub intent: String,
    pub tasks: Vec<String>,
    pub approach: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeprecatedLearning {
    pub id: String,
    pub reason: String,
}

/// Structurally validated reasoner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verdict {
    pub spec_satisfied: SpecSatisfied,
    pub actionable_work_exists: bool,
    pub confidence: Confidence,
    pub task_updates: Vec<TaskUpdate>,
    pub new_tasks: Vec<NewTask>,
    pub gaps: Vec<Gap>,
    pub iteration_plan: IterationPlan,
    pub learnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deprecated_learnings: Vec<DeprecatedLearning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Done,
    Stuck,
    Continue,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Stuck => "STUCK",
            Self::Continue => "CONTINUE",
        }
    }
}

/// Routing decision derived from a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Decision {
    /// Enforce `reason` iff STUCK and `summary` iff DONE.
    pub fn validate(&self) -> Result<()> {
        let has_reason = self.reason.as_deref().is_some_and(|r| !r.trim().is_empty());
        let has_summary = self.summary.as_deref().is_some_and(|s| !s.trim().is_empty());
        match self.outcome {
            Outcome::Stuck if !has_reason => Err(anyhow!("STUCK decision requires a reason")),
            Outcome::Done if !has_summary => Err(anyhow!("DONE decision requires a summary")),
            Outcome::Stuck | Outcome::Continue if has_summary => Err(anyhow!(
                "{} decision must not carry a summary",
                self.outcome.as_str()
            )),
            Outcome::Done | Outcome::Continue if has_reason => Err(anyhow!(
                "{} decision must not carry a reason",
                self.outcome.as_str()
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Stuck,
    MaxIterations,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stuck => "stuck",
            Self::MaxIterations => "max_iterations",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stuck" => Ok(Self::Stuck),
            "max_iterations" => Ok(Self::MaxIterations),
            "aborted" => Ok(Self::Aborted),
            other => Err(anyhow!("unknown run status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationOutcome {
    #[serde(rename = "CONTINUE")]
    Continue,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "STUCK")]
    Stuck,
    #[serde(rename = "incomplete")]
    Incomplete,
}

impl IterationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Done => "DONE",
            Self::Stuck => "STUCK",
            Self::Incomplete => "incomplete",
        }
    }
}

impl From<Outcome> for IterationOutcome {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Done => Self::Done,
            Outcome::Stuck => Self::Stuck,
            Outcome::Continue => Self::Continue,
        }
    }
}

impl FromStr for IterationOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONTINUE" => Ok(Self::Continue),
            "DONE" => Ok(Self::Done),
            "STUCK" => Ok(Self::Stuck),
            "incomplete" => Ok(Self::Incomplete),
            other => Err(anyhow!("unknown iteration outcome '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActStatus {
    Completed,
    Blocked,
}

/// Structured output of the act capability for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActOutput {
    pub task_id: String,
    pub status: ActStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_reason: Option<String>,
    #[serde(default)]
    pub learnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanInputKind {
    Comment,
    Pause,
    Resume,
    Abort,
}

impl HumanInputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Abort => "abort",
        }
    }
}

impl FromStr for HumanInputKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "comment" => Ok(Self::Comment),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "abort" => Ok(Self::Abort),
            other => Err(anyhow!("unknown input kind '{other}'")),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_satisfied_accepts_bool_and_unverifiable() {
        let yes: SpecSatisfied = serde_json::from_str("true").expect("true");
        let no: SpecSatisfied = serde_json::from_str("false").expect("false");
        let unknown: SpecSatisfied = serde_json::from_str("\"unverifiable\"").expect("text");
        assert_eq!(yes, SpecSatisfied::Yes);
        assert_eq!(no, SpecSatisfied::No);
        assert_eq!(unknown, SpecSatisfied::Unverifiable);
        assert_eq!(
            serde_json::to_string(&SpecSatisfied::Unverifiable).expect("ser"),
            "\"unverifiable\""
        );
    }

    #[test]
    fn spec_satisfied_rejects_other_strings() {
        let err = serde_json::from_str::<SpecSatisfied>("\"maybe\"").unwrap_err();
        assert!(err.to_string().contains("unverifiable"));
    }

    #[test]
    fn priority_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Priority::P2).expect("ser"), "2");
        assert!(serde_json::from_str::<Priority>("3").is_err());
    }

    /// Reason is required iff STUCK and summary iff DONE.
    #[test]
    fn decision_validate_enforces_reason_and_summary() {
        let done = Decision {
            outcome: Outcome::Done,
            reason: None,
            summary: Some("ok".to_string()),
        };
        assert!(done.validate().is_ok());

        let done_without_summary = Decision {
            summary: None,
            ..done.clone()
        };
        assert!(done_without_summary.validate().is_err());

        let stuck = Decision {
            outcome: Outcome::Stuck,
            reason: Some("blocked".to_string()),
            summary: None,
        };
        assert!(stuck.validate().is_ok());
        assert!(
            Decision {
                reason: None,
                ..stuck
            }
            .validate()
            .is_err()
        );

        let cont = Decision {
            outcome: Outcome::Continue,
            reason: Some("x".to_string()),
            summary: None,
        };
        assert!(cont.validate().is_err());
    }
}
