//! Structured output validation: the trust boundary for agent output.
//!
//! Raw text is parsed, checked against the embedded JSON Schema (Draft
//! 2020-12), deserialized into typed values, and then checked against the
//! iteration's claims. Every failure is a [`StructuralHalt`]; nothing here is
//! retried.

use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::claims::{Claims, WorkClaims};
use crate::core::task_arena::TaskArena;
use crate::core::types::{ActOutput, ActStatus, Verdict};
use crate::core::verdict_check::check_verdict;
use crate::error::{FieldError, HaltKind, StructuralHalt};

pub const VERDICT_SCHEMA: &str = include_str!("../schemas/verdict.schema.json");
pub const ACT_OUTPUT_SCHEMA: &str = include_str!("../schemas/act_output.schema.json");

const ROOT_FIELD: &str = "__root__";
const SCHEMA_FIELD: &str = "__schema__";

/// Validate raw orient output against the schema and this iteration's claims.
///
/// When the work section is unavailable every task reference fails, since
/// nothing can be verified against it.
pub fn validate_verdict(raw: &str, claims: &Claims) -> Result<Verdict, StructuralHalt> {
    let verdict: Verdict = parse_structured(raw, VERDICT_SCHEMA, "orient verdict")?;

    let empty = WorkClaims {
        root_task_id: None,
        open: Vec::new(),
        blocked: Vec::new(),
        closed: Vec::new(),
        recent_comments: Vec::new(),
        no_root_task: true,
    };
    let work = claims.work().unwrap_or(&empty);
    let arena = TaskArena::from_tasks(work.all_tasks().cloned());
    let errors = check_verdict(&verdict, work, &arena);
    if !errors.is_empty() {
        warn!(errors = errors.len(), "verdict failed referential checks");
        return Err(StructuralHalt::with_fields(
            HaltKind::ReferentialIntegrity,
            "orient verdict",
            errors
                .into_iter()
                .map(|(field, error)| FieldError::new(field, error))
                .collect(),
        ));
    }
    debug!(
        updates = verdict.task_updates.len(),
        new_tasks = verdict.new_tasks.len(),
        gaps = verdict.gaps.len(),
        "verdict validated"
    );
    Ok(verdict)
}

/// Re-check a verdict stored before an interruption against fresh claims.
///
/// Only existence is checked: reconcile instructions may already have been
/// applied, so status checks would reject the verdict's own effects. A
/// degraded work section skips the check.
pub fn check_stored_verdict(verdict: &Verdict, claims: &Claims) -> Result<(), StructuralHalt> {
    let Some(work) = claims.work() else {
        warn!("work claims unavailable; stored verdict not re-checked");
        return Ok(());
    };
    let mut errors = Vec::new();
    let mut require = |field: String, task_id: &str| {
        if work.find(task_id).is_none() {
            errors.push(FieldError::new(field, format!("unknown task '{task_id}'")));
        }
    };
    for (idx, update) in verdict.task_updates.iter().enumerate() {
        require(format!("task_updates[{idx}].task_id"), &update.task_id);
        if let Some(parent) = &update.parent_id {
            require(format!("task_updates[{idx}].parent_id"), parent);
        }
    }
    for (idx, new_task) in verdict.new_tasks.iter().enumerate() {
        if let Some(parent) = &new_task.parent_id {
            require(format!("new_tasks[{idx}].parent_id"), parent);
        }
    }
    for (idx, task_id) in verdict.iteration_plan.tasks.iter().enumerate() {
        require(format!("iteration_plan.tasks[{idx}]"), task_id);
    }
    if errors.is_empty() {
        return Ok(());
    }
    Err(StructuralHalt::with_fields(
        HaltKind::ReferentialIntegrity,
        "stored orient verdict",
        errors,
    ))
}

/// Validate raw act output for `task_id`.
pub fn validate_act_output(raw: &str, task_id: &str) -> Result<ActOutput, StructuralHalt> {
    let output: ActOutput = parse_structured(raw, ACT_OUTPUT_SCHEMA, "act output")?;
    let mut errors = Vec::new();
    if output.task_id != task_id {
        errors.push(FieldError::new(
            "task_id",
            format!("expected '{task_id}', got '{}'", output.task_id),
        ));
    }
    if output.summary.trim().is_empty() {
        errors.push(FieldError::new("summary", "summary must not be empty"));
    }
    if output.status == ActStatus::Blocked
        && output
            .blocker_reason
            .as_deref()
            .is_some_and(|reason| reason.trim().is_empty())
    {
        errors.push(FieldError::new(
            "blocker_reason",
            "blocker_reason must not be empty",
        ));
    }
    if !errors.is_empty() {
        return Err(StructuralHalt::with_fields(
            HaltKind::ReferentialIntegrity,
            "act output",
            errors,
        ));
    }
    Ok(output)
}

fn parse_structured<T: DeserializeOwned>(
    raw: &str,
    schema: &str,
    what: &str,
) -> Result<T, StructuralHalt> {
    let instance: Value = serde_json::from_str(raw.trim()).map_err(|err| {
        debug!(err = %err, "output is not JSON");
        StructuralHalt::with_fields(
            HaltKind::MalformedOutput,
            what,
            vec![FieldError::new(ROOT_FIELD, "Invalid JSON")],
        )
    })?;

    let validator = compile(schema, what)?;
    let messages: Vec<FieldError> = validator
        .iter_errors(&instance)
        .map(|err| FieldError::new(SCHEMA_FIELD, err.to_string()))
        .collect();
    if !messages.is_empty() {
        return Err(StructuralHalt::with_fields(
            HaltKind::SchemaViolation,
            what,
            messages,
        ));
    }

    serde_json::from_value(instance).map_err(|err| {
        StructuralHalt::with_fields(
            HaltKind::SchemaViolation,
            what,
            vec![FieldError::new(ROOT_FIELD, err.to_string())],
        )
    })
}

fn compile(schema: &str, what: &str) -> Result<Validator, StructuralHalt> {
    let invalid = |err: String| {
        StructuralHalt::new(
            HaltKind::InvalidState,
            format!("embedded schema for {what}: {err}"),
        )
    };
    let schema: Value = serde_json::from_str(schema).map_err(|err| invalid(err.to_string()))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| invalid(err.to_string()))
}
