//! Planning for the task graph reconciler.
//!
//! Turns a verified verdict plus the same iteration's claims into an ordered
//! list of tracker instructions. Every instruction carries an idempotency key
//! derived from the iteration number and the instruction itself, so a batch
//! interrupted part-way can be replayed without double-applying anything.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::claims::{Claims, WorkClaims};
use crate::core::types::{
    NewTask, Priority, Severity, Task, TaskAction, TaskStatus, TaskUpdate, Verdict,
};

/// Token-set similarity at or above which two descriptions count as duplicates.
pub const DUPLICATE_SIMILARITY: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Close {
        task_id: String,
        proof: String,
    },
    Unblock {
        task_id: String,
        evidence: String,
    },
    Create {
        title: String,
        description: String,
        parent_id: Option<String>,
        priority: Priority,
        origin: String,
    },
    SetPriority {
        task_id: String,
        priority: Priority,
    },
    Reparent {
        task_id: String,
        parent_id: String,
    },
    Block {
        task_id: String,
        reason: String,
    },
    Comment {
        task_id: String,
        text: String,
    },
}

impl Instruction {
    /// The task this instruction targets, or `None` for creations.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Close { task_id, .. }
            | Self::Unblock { task_id, .. }
            | Self::SetPriority { task_id, .. }
            | Self::Reparent { task_id, .. }
            | Self::Block { task_id, .. }
            | Self::Comment { task_id, .. } => Some(task_id),
            Self::Create { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Close { .. } => "close",
            Self::Unblock { .. } => "unblock",
            Self::Create { .. } => "create",
            Self::SetPriority { .. } => "set_priority",
            Self::Reparent { .. } => "reparent",
            Self::Block { .. } => "block",
            Self::Comment { .. } => "comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedInstruction {
    pub key: String,
    pub instruction: Instruction,
}

/// Verdict item that was deliberately not turned into an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapDisposition {
    /// A new task will be created by the instruction with this key.
    NewTask { key: String },
    /// An existing active task already covers the gap.
    Existing { task_id: String },
    /// Minor gap recorded without a task.
    Recorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRecord {
    pub description: String,
    pub severity: Severity,
    pub disposition: GapDisposition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub instructions: Vec<PlannedInstruction>,
    pub skipped: Vec<Skipped>,
    pub gaps: Vec<GapRecord>,
    /// Tasks unblocked by this plan; eligible for the current iteration.
    pub unblocked: BTreeSet<String>,
    /// Tasks closed by this plan.
    pub closed: BTreeSet<String>,
}

/// Whether a blocked task's stated blocking condition still holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockerStatus {
    Cleared { evidence: String },
    Holds { detail: String },
    /// The condition is free text the claims cannot confirm or refute.
    Unverifiable,
}

static DEPENDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:depends on|blocked by|waiting on)\s+([A-Za-z0-9_.-]+)")
        .expect("depends regex")
});
static MERGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)merge conflict(?:\s+on\s+(\S+))?").expect("merge regex")
});
static FAILING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)failing tests?:\s*(.+)$").expect("failing regex"));

/// Evaluate a blocked task's condition against this iteration's claims.
pub fn blocker_status(task: &Task, claims: &Claims) -> BlockerStatus {
    let reason = task.blocker_reason.as_deref().unwrap_or_default();
    let Some(work) = claims.work() else {
        return BlockerStatus::Unverifiable;
    };

    let mut deps: BTreeSet<String> = task.blocked_by.iter().cloned().collect();
    for caps in DEPENDS_RE.captures_iter(reason) {
        let id = caps[1].trim_end_matches(['.', ',', ';']);
        if work.find(id).is_some() {
            deps.insert(id.to_string());
        }
    }
    if !deps.is_empty() {
        for dep in &deps {
            match work.status_of(dep) {
                Some(TaskStatus::Closed) => {}
                Some(status) => {
                    return BlockerStatus::Holds {
                        detail: format!("dependency {dep} is still {}", status.as_str()),
                    };
                }
                None => {
                    return BlockerStatus::Holds {
                        detail: format!("dependency {dep} is not visible in the tracker"),
                    };
                }
            }
        }
        let list: Vec<&str> = deps.iter().map(String::as_str).collect();
        return BlockerStatus::Cleared {
            evidence: format!("dependencies closed: {}", list.join(", ")),
        };
    }

    if let Some(caps) = MERGE_RE.captures(reason) {
        let pending = claims.pending_merges();
        let branch = caps.get(1).map(|m| m.as_str().trim_end_matches(['.', ',', ';']));
        let still_pending = match branch {
            Some(branch) => pending.iter().any(|merge| merge.branch == branch),
            None => !pending.is_empty(),
        };
        if still_pending {
            return BlockerStatus::Holds {
                detail: "merge conflict is still pending".to_string(),
            };
        }
        return BlockerStatus::Cleared {
            evidence: "no pending merge conflict reported".to_string(),
        };
    }

    if let Some(caps) = FAILING_RE.captures(reason) {
        let Some(project) = claims.project.data() else {
            return BlockerStatus::Unverifiable;
        };
        let still: Vec<&str> = caps[1]
            .split(',')
            .map(str::trim)
            .filter(|t| project.last_failing_tests.contains(*t))
            .collect();
        if still.is_empty() {
            return BlockerStatus::Cleared {
                evidence: "previously failing tests no longer fail".to_string(),
            };
        }
        return BlockerStatus::Holds {
            detail: format!("still failing: {}", still.join(", ")),
        };
    }

    BlockerStatus::Unverifiable
}

/// Build the ordered instruction plan: closes, unblocks, creations, then updates.
pub fn plan_reconciliation(verdict: &Verdict, claims: &Claims, iteration: u32) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let work = claims.work();
    let root_id = work.and_then(|w| w.root_task_id.clone());

    for update in updates_with(verdict, TaskAction::Close) {
        plan.closed.insert(update.task_id.clone());
        push(
            &mut plan,
            iteration,
            Instruction::Close {
                task_id: update.task_id.clone(),
                proof: update.reason.trim().to_string(),
            },
        );
    }

    for update in updates_with(verdict, TaskAction::Unblock) {
        let Some(task) = work.and_then(|w| w.find(&update.task_id)) else {
            plan.skipped.push(Skipped {
                subject: update.task_id.clone(),
                reason: "unblock target not found in claims".to_string(),
            });
            continue;
        };
        let evidence = match blocker_status(task, claims) {
            BlockerStatus::Cleared { evidence } => evidence,
            BlockerStatus::Unverifiable => update.reason.trim().to_string(),
            BlockerStatus::Holds { detail } => {
                plan.skipped.push(Skipped {
                    subject: update.task_id.clone(),
                    reason: format!("blocking condition still holds: {detail}"),
                });
                continue;
            }
        };
        plan.unblocked.insert(update.task_id.clone());
        push(
            &mut plan,
            iteration,
            Instruction::Unblock {
                task_id: update.task_id.clone(),
                evidence,
            },
        );
    }

    let mut pending_descriptions: Vec<String> = Vec::new();
    for gap in &verdict.gaps {
        let wants_task =
            matches!(gap.severity, Severity::Blocking | Severity::Important) || gap.create_task;
        if !wants_task {
            plan.gaps.push(GapRecord {
                description: gap.description.clone(),
                severity: gap.severity,
                disposition: GapDisposition::Recorded,
            });
            continue;
        }
        if let Some(existing) = work.and_then(|w| find_duplicate(w, &gap.description)) {
            plan.gaps.push(GapRecord {
                description: gap.description.clone(),
                severity: gap.severity,
                disposition: GapDisposition::Existing {
                    task_id: existing.to_string(),
                },
            });
            continue;
        }
        if pending_descriptions
            .iter()
            .any(|pending| is_similar(pending, &gap.description))
        {
            plan.gaps.push(GapRecord {
                description: gap.description.clone(),
                severity: gap.severity,
                disposition: GapDisposition::Recorded,
            });
            continue;
        }
        pending_descriptions.push(gap.description.clone());
        let key = push(
            &mut plan,
            iteration,
            Instruction::Create {
                title: gap_title(&gap.description),
                description: gap.description.trim().to_string(),
                parent_id: root_id.clone(),
                priority: gap_priority(gap.severity),
                origin: format!("gap:{}", gap.severity.as_str()),
            },
        );
        plan.gaps.push(GapRecord {
            description: gap.description.clone(),
            severity: gap.severity,
            disposition: GapDisposition::NewTask { key },
        });
    }

    for new_task in &verdict.new_tasks {
        if let Some(reason) = duplicate_new_task(work, &pending_descriptions, new_task) {
            plan.skipped.push(Skipped {
                subject: new_task.title.clone(),
                reason,
            });
            continue;
        }
        pending_descriptions.push(format!("{} {}", new_task.title, new_task.description));
        push(
            &mut plan,
            iteration,
            Instruction::Create {
                title: new_task.title.trim().to_string(),
                description: new_task.description.trim().to_string(),
                parent_id: new_task.parent_id.clone().or_else(|| root_id.clone()),
                priority: new_task.priority.unwrap_or_default(),
                origin: "verdict".to_string(),
            },
        );
    }

    for update in &verdict.task_updates {
        match update.action {
            TaskAction::Close | TaskAction::Unblock => {}
            TaskAction::Block => {
                push(
                    &mut plan,
                    iteration,
                    Instruction::Block {
                        task_id: update.task_id.clone(),
                        reason: update.reason.trim().to_string(),
                    },
                );
            }
            TaskAction::Update => plan_update(&mut plan, iteration, update),
        }
    }

    plan
}

fn plan_update(plan: &mut ReconcilePlan, iteration: u32, update: &TaskUpdate) {
    if let Some(priority) = update.priority {
        push(
            plan,
            iteration,
            Instruction::SetPriority {
                task_id: update.task_id.clone(),
                priority,
            },
        );
    }
    if let Some(parent_id) = &update.parent_id {
        push(
            plan,
            iteration,
            Instruction::Reparent {
                task_id: update.task_id.clone(),
                parent_id: parent_id.clone(),
            },
        );
    }
    let text = update.reason.trim();
    if !text.is_empty() {
        push(
            plan,
            iteration,
            Instruction::Comment {
                task_id: update.task_id.clone(),
                text: text.to_string(),
            },
        );
    }
}

fn updates_with(verdict: &Verdict, action: TaskAction) -> impl Iterator<Item = &TaskUpdate> {
    verdict
        .task_updates
        .iter()
        .filter(move |update| update.action == action)
}

fn push(plan: &mut ReconcilePlan, iteration: u32, instruction: Instruction) -> String {
    let key = instruction_key(iteration, &instruction);
    plan.instructions.push(PlannedInstruction {
        key: key.clone(),
        instruction,
    });
    key
}

/// Idempotency key: `<task id or "new">:<sha256(iteration + instruction)>`.
pub fn instruction_key(iteration: u32, instruction: &Instruction) -> String {
    let canonical = serde_json::to_string(instruction).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(iteration.to_be_bytes());
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let subject = instruction.task_id().unwrap_or("new");
    format!("{subject}:{}", &digest[..16])
}

/// Tasks from the iteration plan that may be executed now.
///
/// Open tasks are eligible; blocked tasks only when this plan unblocks them.
pub fn eligible_plan_tasks(
    verdict: &Verdict,
    work: &WorkClaims,
    plan: &ReconcilePlan,
) -> (Vec<String>, Vec<Skipped>) {
    let mut eligible = Vec::new();
    let mut skipped = Vec::new();
    let mut seen = BTreeSet::new();
    for task_id in &verdict.iteration_plan.tasks {
        if !seen.insert(task_id.clone()) {
            continue;
        }
        if plan.closed.contains(task_id) {
            skipped.push(Skipped {
                subject: task_id.clone(),
                reason: "closed by this verdict".to_string(),
            });
            continue;
        }
        match work.status_of(task_id) {
            Some(TaskStatus::Open | TaskStatus::InProgress) => eligible.push(task_id.clone()),
            Some(TaskStatus::Blocked) if plan.unblocked.contains(task_id) => {
                eligible.push(task_id.clone());
            }
            Some(status) => skipped.push(Skipped {
                subject: task_id.clone(),
                reason: format!("task is {}", status.as_str()),
            }),
            None => skipped.push(Skipped {
                subject: task_id.clone(),
                reason: "task not found in claims".to_string(),
            }),
        }
    }
    (eligible, skipped)
}

fn duplicate_new_task(
    work: Option<&WorkClaims>,
    pending: &[String],
    new_task: &NewTask,
) -> Option<String> {
    let text = format!("{} {}", new_task.title, new_task.description);
    if let Some(existing) = work.and_then(|w| find_duplicate(w, &new_task.title)) {
        return Some(format!("duplicates active task {existing}"));
    }
    if pending.iter().any(|p| is_similar(p, &text)) {
        return Some("duplicates another task created by this verdict".to_string());
    }
    None
}

/// Id of an active task whose title or description matches `text`.
pub fn find_duplicate<'a>(work: &'a WorkClaims, text: &str) -> Option<&'a str> {
    work.open
        .iter()
        .chain(work.blocked.iter())
        .filter(|task| Some(&task.id) != work.root_task_id.as_ref())
        .find(|task| is_similar(&task.title, text) || is_similar(&task.description, text))
        .map(|task| task.id.as_str())
}

/// Fuzzy match on normalized word tokens: one side's words all appear in the
/// other (at least two of them), or Jaccard overlap reaches the threshold.
pub fn is_similar(a: &str, b: &str) -> bool {
    let na = normalize(a);
    let nb = normalize(b);
    let ta: BTreeSet<&str> = na.split_whitespace().collect();
    let tb: BTreeSet<&str> = nb.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return false;
    }
    let (small, large) = if ta.len() <= tb.len() { (&ta, &tb) } else { (&tb, &ta) };
    if small == large || (small.len() >= 2 && small.is_subset(large)) {
        return true;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union >= DUPLICATE_SIMILARITY
}

fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::claims::{PendingMerge, ProjectClaims, Section};
    use crate::core::types::{Confidence, Gap, IterationPlan, SpecSatisfied};

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

    fn blocked(id: &str, reason: &str) -> Task {
        Task {
            blocker_reason: Some(reason.to_string()),
            ..task(id, TaskStatus::Blocked)
        }
    }

    fn claims(open: Vec<Task>, blocked: Vec<Task>, closed: Vec<Task>) -> Claims {
        let mut all_open = vec![Task {
            parent_id: None,
            ..task("root", TaskStatus::Open)
        }];
        all_open.extend(open);
        Claims {
            timestamp: "t".to_string(),
            iteration_number: 3,
            code: Section::Unavailable("skipped".to_string()),
            work: Section::Collected(WorkClaims {
                root_task_id: Some("root".to_string()),
                open: all_open,
                blocked,
                closed,
                recent_comments: Vec::new(),
                no_root_task: false,
            }),
            project: Section::Collected(ProjectClaims {
                iteration_number: 3,
                first_iteration: false,
                history: Vec::new(),
                agent_summaries: Vec::new(),
                pending_merges: Vec::new(),
                stagnation: None,
                last_failing_tests: BTreeSet::new(),
                kickstart: false,
            }),
            human: Section::Unavailable("skipped".to_string()),
        }
    }

    fn verdict() -> Verdict {
        Verdict {
            spec_satisfied: SpecSatisfied::No,
            actionable_work_exists: true,
            confidence: Confidence::High,
            task_updates: Vec::new(),
            new_tasks: Vec::new(),
            gaps: Vec::new(),
            iteration_plan: IterationPlan {
                intent: "work".to_string(),
                tasks: Vec::new(),
                approach: String::new(),
            },
            learnings: Vec::new(),
            deprecated_learnings: Vec::new(),
            summary: None,
        }
    }

    fn update(task_id: &str, action: TaskAction, reason: &str) -> TaskUpdate {
        TaskUpdate {
            task_id: task_id.to_string(),
            action,
            reason: reason.to_string(),
            priority: None,
            parent_id: None,
        }
    }

    #[test]
    fn instructions_follow_close_unblock_create_update_order() {
        let c = claims(
            vec![task("t1", TaskStatus::Open), task("t2", TaskStatus::Open)],
            vec![blocked("t3", "waiting for API keys")],
            Vec::new(),
        );
        let mut v = verdict();
        v.task_updates = vec![
            TaskUpdate {
                priority: Some(Priority::P0),
                ..update("t2", TaskAction::Update, "")
            },
            update("t3", TaskAction::Unblock, "keys are now in .env.example"),
            update("t1", TaskAction::Close, "login handler in src/auth.rs with tests"),
        ];
        v.gaps = vec![Gap {
            description: "Rate limiting is missing".to_string(),
            severity: Severity::Important,
            create_task: false,
        }];

        let plan = plan_reconciliation(&v, &c, 3);
        let labels: Vec<&str> = plan
            .instructions
            .iter()
            .map(|p| p.instruction.label())
            .collect();
        assert_eq!(labels, vec!["close", "unblock", "create", "set_priority"]);
        assert!(plan.unblocked.contains("t3"));
        assert!(plan.closed.contains("t1"));
    }

    /// Reprioritization never produces a status change.
    #[test]
    fn update_with_priority_only_touches_priority() {
        let c = claims(vec![task("t1", TaskStatus::Open)], Vec::new(), Vec::new());
        let mut v = verdict();
        v.task_updates = vec![TaskUpdate {
            priority: Some(Priority::P2),
            ..update("t1", TaskAction::Update, "")
        }];
        let plan = plan_reconciliation(&v, &c, 1);
        assert_eq!(
            plan.instructions
                .iter()
                .map(|p| p.instruction.clone())
                .collect::<Vec<_>>(),
            vec![Instruction::SetPriority {
                task_id: "t1".to_string(),
                priority: Priority::P2
            }]
        );
    }

    #[test]
    fn dependency_blocker_clears_only_when_dependency_closed() {
        let mut waiting = blocked("t3", "depends on t1");
        waiting.blocked_by = vec!["t1".to_string()];

        let still_open = claims(
            vec![task("t1", TaskStatus::Open)],
            vec![waiting.clone()],
            Vec::new(),
        );
        assert!(matches!(
            blocker_status(&waiting, &still_open),
            BlockerStatus::Holds { .. }
        ));

        let done = claims(Vec::new(), vec![waiting.clone()], vec![task("t1", TaskStatus::Closed)]);
        assert!(matches!(
            blocker_status(&waiting, &done),
            BlockerStatus::Cleared { .. }
        ));
    }

    /// A task unblocked in this plan is immediately eligible for this iteration.
    #[test]
    fn unblocked_task_is_eligible_in_same_iteration() {
        let waiting = blocked("t3", "depends on t1");
        let c = claims(
            vec![task("t4", TaskStatus::Open)],
            vec![waiting],
            vec![task("t1", TaskStatus::Closed)],
        );
        let mut v = verdict();
        v.task_updates = vec![update("t3", TaskAction::Unblock, "t1 is closed")];
        v.iteration_plan.tasks = vec!["t3".to_string(), "t4".to_string(), "t1".to_string()];

        let plan = plan_reconciliation(&v, &c, 3);
        let (eligible, skipped) = eligible_plan_tasks(&v, c.work().expect("work"), &plan);
        assert_eq!(eligible, vec!["t3".to_string(), "t4".to_string()]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].subject, "t1");
    }

    #[test]
    fn unblock_is_skipped_while_merge_conflict_pending() {
        let waiting = blocked("t3", "merge conflict on ooda/iteration-2");
        let mut c = claims(Vec::new(), vec![waiting], Vec::new());
        if let Section::Collected(project) = &mut c.project {
            project.pending_merges.push(PendingMerge {
                branch: "ooda/iteration-2".to_string(),
                iteration: 2,
                reason: "conflict".to_string(),
                conflicts: vec!["src/lib.rs".to_string()],
            });
        }
        let mut v = verdict();
        v.task_updates = vec![update("t3", TaskAction::Unblock, "resolved")];
        let plan = plan_reconciliation(&v, &c, 3);
        assert!(plan.instructions.is_empty());
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].reason.contains("still holds"));
    }

    #[test]
    fn gaps_dedupe_against_active_tasks_and_minor_gaps_are_recorded() {
        let mut existing = task("t1", TaskStatus::Open);
        existing.title = "Add rate limiting to the API".to_string();
        let c = claims(vec![existing], Vec::new(), Vec::new());
        let mut v = verdict();
        v.gaps = vec![
            Gap {
                description: "add rate limiting to the API".to_string(),
                severity: Severity::Blocking,
                create_task: false,
            },
            Gap {
                description: "README typo".to_string(),
                severity: Severity::Minor,
                create_task: false,
            },
            Gap {
                description: "Changelog is missing".to_string(),
                severity: Severity::Minor,
                create_task: true,
            },
        ];
        let plan = plan_reconciliation(&v, &c, 1);
        assert_eq!(
            plan.gaps[0].disposition,
            GapDisposition::Existing {
                task_id: "t1".to_string()
            }
        );
        assert_eq!(plan.gaps[1].disposition, GapDisposition::Recorded);
        assert!(matches!(plan.gaps[2].disposition, GapDisposition::NewTask { .. }));
        assert_eq!(plan.instructions.len(), 1);
    }

    #[test]
    fn blocking_gap_is_not_absorbed_by_a_task_sharing_a_prefix() {
        let mut existing = task("t1", TaskStatus::Open);
        existing.title = "Fix CI".to_string();
        existing.description = "Fix CI".to_string();
        let c = claims(vec![existing], Vec::new(), Vec::new());
        let mut v = verdict();
        v.gaps = vec![Gap {
            description: "Fix circular import in parser".to_string(),
            severity: Severity::Blocking,
            create_task: false,
        }];
        let plan = plan_reconciliation(&v, &c, 1);
        assert!(matches!(plan.gaps[0].disposition, GapDisposition::NewTask { .. }));
        assert_eq!(plan.instructions.len(), 1);
    }

    #[test]
    fn keys_are_stable_per_iteration_and_differ_across_iterations() {
        let c = claims(vec![task("t1", TaskStatus::Open)], Vec::new(), Vec::new());
        let mut v = verdict();
        v.task_updates = vec![update("t1", TaskAction::Close, "verified in src/a.rs")];
        let first = plan_reconciliation(&v, &c, 4);
        let again = plan_reconciliation(&v, &c, 4);
        let later = plan_reconciliation(&v, &c, 5);
        assert_eq!(first.instructions, again.instructions);
        assert_ne!(first.instructions[0].key, later.instructions[0].key);
        assert!(first.instructions[0].key.starts_with("t1:"));
    }

    #[test]
    fn similarity_uses_word_tokens_and_jaccard() {
        assert!(is_similar("Add login tests", "add login tests for auth"));
        assert!(!is_similar("Fix CI", "Fix circular import in parser"));
        assert!(!is_similar("fix", "fix the flaky upload test"));
        assert!(is_similar("Übersetzung ergänzen", "ÜBERSETZUNG ERGÄNZEN"));
        assert!(is_similar("cache layer for user lookups", "user lookups cache layer missing"));
        assert!(!is_similar("add login tests", "write deployment docs"));
        assert!(!is_similar("", "anything"));
    }
}
