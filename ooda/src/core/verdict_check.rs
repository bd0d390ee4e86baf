//! Referential checks for a schema-valid verdict.
//!
//! Every task id the verdict names must exist in the same iteration's work
//! claims, and every requested transition must be legal for the task's
//! current status. Returns `(field, error)` pairs (empty on success).

use std::collections::BTreeSet;

use crate::core::claims::WorkClaims;
use crate::core::task_arena::TaskArena;
use crate::core::types::{TaskAction, TaskStatus, Verdict};

pub fn check_verdict(
    verdict: &Verdict,
    work: &WorkClaims,
    arena: &TaskArena,
) -> Vec<(String, String)> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    let mut unblocked = BTreeSet::new();
    let mut closed = BTreeSet::new();

    for (idx, update) in verdict.task_updates.iter().enumerate() {
        let field = format!("task_updates[{idx}]");
        if !seen.insert((update.task_id.as_str(), update.action)) {
            errors.push((
                format!("{field}.action"),
                format!(
                    "duplicate '{}' for task '{}'",
                    update.action.as_str(),
                    update.task_id
                ),
            ));
        }
        let Some(task) = work.find(&update.task_id) else {
            errors.push((
                format!("{field}.task_id"),
                format!("unknown task '{}'", update.task_id),
            ));
            continue;
        };
        let reason_missing = update.reason.trim().is_empty();
        match update.action {
            TaskAction::Close => {
                if reason_missing {
                    errors.push((
                        format!("{field}.reason"),
                        "close requires proof observed in code".to_string(),
                    ));
                }
                if task.status == TaskStatus::Closed {
                    errors.push((
                        format!("{field}.task_id"),
                        format!("task '{}' is already closed", task.id),
                    ));
                }
                if Some(&task.id) == work.root_task_id.as_ref() {
                    errors.push((
                        format!("{field}.task_id"),
                        "the root task closes with the run, not by verdict".to_string(),
                    ));
                }
                closed.insert(task.id.as_str());
            }
            TaskAction::Block => {
                if reason_missing {
                    errors.push((
                        format!("{field}.reason"),
                        "block requires a reason".to_string(),
                    ));
                }
                if task.status == TaskStatus::Closed {
                    errors.push((
                        format!("{field}.task_id"),
                        format!("cannot block closed task '{}'", task.id),
                    ));
                }
            }
            TaskAction::Unblock => {
                if task.status != TaskStatus::Blocked {
                    errors.push((
                        format!("{field}.task_id"),
                        format!(
                            "unblock targets task '{}' which is {}",
                            task.id,
                            task.status.as_str()
                        ),
                    ));
                }
                unblocked.insert(task.id.as_str());
            }
            TaskAction::Update => {}
        }
        if let Some(parent) = &update.parent_id {
            if update.action != TaskAction::Update {
                errors.push((
                    format!("{field}.parent_id"),
                    "parent_id is only valid on update".to_string(),
                ));
            } else if !arena.contains(parent) {
                errors.push((
                    format!("{field}.parent_id"),
                    format!("unknown parent '{parent}'"),
                ));
            } else if arena.would_cycle(&update.task_id, parent) {
                errors.push((
                    format!("{field}.parent_id"),
                    format!(
                        "moving '{}' under '{parent}' would create a cycle",
                        update.task_id
                    ),
                ));
            }
        }
    }

    for (idx, new_task) in verdict.new_tasks.iter().enumerate() {
        if new_task.title.trim().is_empty() {
            errors.push((
                format!("new_tasks[{idx}].title"),
                "title must not be empty".to_string(),
            ));
        }
        if let Some(parent) = &new_task.parent_id
            && work.find(parent).is_none()
        {
            errors.push((
                format!("new_tasks[{idx}].parent_id"),
                format!("unknown parent '{parent}'"),
            ));
        }
    }

    for (idx, task_id) in verdict.iteration_plan.tasks.iter().enumerate() {
        let field = format!("iteration_plan.tasks[{idx}]");
        match work.status_of(task_id) {
            None => errors.push((field, format!("unknown task '{task_id}'"))),
            Some(TaskStatus::Closed) => {
                errors.push((field, format!("task '{task_id}' is closed")));
            }
            Some(TaskStatus::Blocked) if !unblocked.contains(task_id.as_str()) => errors.push((
                field,
                format!("task '{task_id}' is blocked and not unblocked by this verdict"),
            )),
            Some(_) if closed.contains(task_id.as_str()) => errors.push((
                field,
                format!("task '{task_id}' is closed by this verdict"),
            )),
            Some(_) => {}
        }
    }

    for (idx, deprecated) in verdict.deprecated_learnings.iter().enumerate() {
        if deprecated.reason.trim().is_empty() {
            errors.push((
                format!("deprecated_learnings[{idx}].reason"),
                "deprecation requires a reason".to_string(),
            ));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        Confidence, IterationPlan, NewTask, Priority, SpecSatisfied, Task, TaskUpdate,
    };

    fn task(id: &str, status: TaskStatus, parent: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: Priority::P1,
            blocker_reason: (status == TaskStatus::Blocked).then(|| "waiting".to_string()),
            parent_id: parent.map(str::to_string),
            blocked_by: Vec::new(),
        }
    }

    fn work() -> WorkClaims {
        WorkClaims {
            root_task_id: Some("root".to_string()),
            open: vec![
                task("root", TaskStatus::Open, None),
                task("a", TaskStatus::Open, Some("root")),
                task("a1", TaskStatus::Open, Some("a")),
            ],
            blocked: vec![task("b", TaskStatus::Blocked, Some("root"))],
            closed: vec![task("c", TaskStatus::Closed, Some("root"))],
            recent_comments: Vec::new(),
            no_root_task: false,
        }
    }

    fn arena(work: &WorkClaims) -> TaskArena {
        TaskArena::from_tasks(work.all_tasks().cloned())
    }

    fn verdict() -> Verdict {
        Verdict {
            spec_satisfied: SpecSatisfied::No,
            actionable_work_exists: true,
            confidence: Confidence::Medium,
            task_updates: Vec::new(),
            new_tasks: Vec::new(),
            gaps: Vec::new(),
            iteration_plan: IterationPlan {
                intent: "x".to_string(),
                tasks: vec!["a".to_string()],
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

    fn fields(errors: &[(String, String)]) -> Vec<&str> {
        errors.iter().map(|(field, _)| field.as_str()).collect()
    }

    #[test]
    fn accepts_consistent_verdict() {
        let w = work();
        let mut v = verdict();
        v.task_updates = vec![update("b", TaskAction::Unblock, "dependency landed")];
        v.iteration_plan.tasks = vec!["a".to_string(), "b".to_string()];
        assert!(check_verdict(&v, &w, &arena(&w)).is_empty());
    }

    #[test]
    fn rejects_unknown_ids_and_missing_proof() {
        let w = work();
        let mut v = verdict();
        v.task_updates = vec![
            update("ghost", TaskAction::Update, "x"),
            update("a", TaskAction::Close, "  "),
        ];
        v.new_tasks = vec![NewTask {
            title: "t".to_string(),
            description: String::new(),
            parent_id: Some("nope".to_string()),
            priority: None,
        }];
        v.iteration_plan.tasks = vec!["zzz".to_string()];
        let errors = check_verdict(&v, &w, &arena(&w));
        assert_eq!(
            fields(&errors),
            vec![
                "task_updates[0].task_id",
                "task_updates[1].reason",
                "new_tasks[0].parent_id",
                "iteration_plan.tasks[0]",
            ]
        );
    }

    #[test]
    fn blocked_plan_task_requires_unblock_in_same_verdict() {
        let w = work();
        let mut v = verdict();
        v.iteration_plan.tasks = vec!["b".to_string(), "c".to_string()];
        let errors = check_verdict(&v, &w, &arena(&w));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].1.contains("blocked"));
        assert!(errors[1].1.contains("closed"));
    }

    #[test]
    fn reparent_cycle_and_unblock_of_open_task_are_rejected() {
        let w = work();
        let mut v = verdict();
        v.task_updates = vec![
            TaskUpdate {
                parent_id: Some("a1".to_string()),
                ..update("a", TaskAction::Update, "move")
            },
            update("a1", TaskAction::Unblock, "x"),
        ];
        let errors = check_verdict(&v, &w, &arena(&w));
        assert!(errors[0].1.contains("cycle"));
        assert!(errors[1].1.contains("which is open"));
    }

    #[test]
    fn duplicate_update_for_same_action_is_rejected() {
        let w = work();
        let mut v = verdict();
        v.task_updates = vec![
            update("a", TaskAction::Update, "one"),
            update("a", TaskAction::Update, "two"),
        ];
        let errors = check_verdict(&v, &w, &arena(&w));
        assert_eq!(fields(&errors), vec!["task_updates[1].action"]);
    }
}
