//! Apply a reconcile plan to the work tracker.
//!
//! Each instruction is applied at most once per iteration: its key is marked
//! in the store right after the tracker accepts it, and marked keys are
//! skipped on replay. Created task ids are stored with the mark so a replay
//! can still resolve gap dispositions.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::reconcile::{GapDisposition, Instruction, ReconcilePlan};
use crate::core::retry::RetryPolicy;
use crate::core::types::TaskStatus;
use crate::io::retry::retry_transient;
use crate::io::signal::CancelFlag;
use crate::io::store::Store;
use crate::io::tracker::{TaskChange, TaskDraft, Tracker};

const GAPS_MARK: &str = "gaps:recorded";

pub struct ReconcileContext<'a> {
    pub tracker: &'a dyn Tracker,
    pub store: &'a Store,
    pub retry: RetryPolicy,
    pub cancel: &'a CancelFlag,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Instructions applied by this call, as `label:subject`.
    pub applied: Vec<String>,
    /// Instructions skipped because an earlier attempt already applied them.
    pub replayed: usize,
    /// Instruction key to created task id, across attempts.
    pub created: BTreeMap<String, String>,
}

#[instrument(skip_all, fields(iteration_id = iteration_id, instructions = plan.instructions.len()))]
pub fn apply_plan(
    ctx: &ReconcileContext<'_>,
    iteration_id: i64,
    plan: &ReconcilePlan,
) -> Result<ReconcileReport> {
    let marks = ctx.store.applied_marks(iteration_id)?;
    let mut report = ReconcileReport::default();

    for planned in &plan.instructions {
        if let Some(created) = marks.get(&planned.key) {
            if let Some(task_id) = created {
                report.created.insert(planned.key.clone(), task_id.clone());
            }
            report.replayed += 1;
            continue;
        }
        ctx.cancel.check()?;
        let instruction = &planned.instruction;
        let created = retry_transient(
            &ctx.retry,
            &format!("tracker {}", instruction.label()),
            ctx.cancel,
            || apply_instruction(ctx.tracker, instruction),
        )?;
        ctx.store.mark_applied(
            iteration_id,
            &planned.key,
            instruction.label(),
            created.as_deref(),
        )?;
        let subject = created
            .as_deref()
            .or(instruction.task_id())
            .unwrap_or("new")
            .to_string();
        debug!(op = instruction.label(), task_id = %subject, "instruction applied");
        if let Some(task_id) = created {
            report.created.insert(planned.key.clone(), task_id);
        }
        report
            .applied
            .push(format!("{}:{subject}", instruction.label()));
    }

    for skipped in &plan.skipped {
        info!(subject = %skipped.subject, reason = %skipped.reason, "verdict item skipped");
    }

    if !marks.contains_key(GAPS_MARK) {
        for gap in &plan.gaps {
            let task_id = match &gap.disposition {
                GapDisposition::NewTask { key } => report.created.get(key).map(String::as_str),
                GapDisposition::Existing { task_id } => Some(task_id.as_str()),
                GapDisposition::Recorded => None,
            };
            ctx.store
                .record_gap(iteration_id, &gap.description, gap.severity.as_str(), task_id)?;
        }
        ctx.store
            .mark_applied(iteration_id, GAPS_MARK, "gaps", None)?;
    }

    info!(
        applied = report.applied.len(),
        replayed = report.replayed,
        created = report.created.len(),
        "reconciliation complete"
    );
    Ok(report)
}

/// Apply one instruction; returns the id of a created task.
fn apply_instruction(tracker: &dyn Tracker, instruction: &Instruction) -> Result<Option<String>> {
    match instruction {
        Instruction::Close { task_id, proof } => {
            tracker.close(task_id, &format!("Verified closed: {proof}"))?;
        }
        Instruction::Unblock { task_id, evidence } => {
            tracker.update(
                task_id,
                &TaskChange {
                    status: Some(TaskStatus::Open),
                    ..TaskChange::default()
                },
            )?;
            tracker.comment(task_id, &format!("Unblocked: {evidence}"))?;
        }
        Instruction::Create {
            title,
            description,
            parent_id,
            priority,
            ..
        } => {
            let id = tracker.create(&TaskDraft {
                title: title.clone(),
                description: description.clone(),
                parent_id: parent_id.clone(),
                priority: *priority,
            })?;
            return Ok(Some(id));
        }
        Instruction::SetPriority { task_id, priority } => {
            tracker.update(
                task_id,
                &TaskChange {
                    priority: Some(*priority),
                    ..TaskChange::default()
                },
            )?;
        }
        Instruction::Reparent { task_id, parent_id } => {
            tracker.update(
                task_id,
                &TaskChange {
                    parent_id: Some(parent_id.clone()),
                    ..TaskChange::default()
                },
            )?;
        }
        Instruction::Block { task_id, reason } => {
            tracker.update(
                task_id,
                &TaskChange {
                    status: Some(TaskStatus::Blocked),
                    reason: Some(reason.clone()),
                    ..TaskChange::default()
                },
            )?;
        }
        Instruction::Comment { task_id, text } => tracker.comment(task_id, text)?,
    }
    Ok(None)
}
