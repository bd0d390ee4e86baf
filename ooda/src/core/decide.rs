//! Decision routing from a verified verdict.

use crate::core::types::{Decision, Outcome, SpecSatisfied, Verdict};

const DEFAULT_DONE_SUMMARY: &str = "Spec satisfied";
const DEFAULT_STUCK_REASON: &str = "No actionable work exists and spec is not satisfied";

/// Map `(spec_satisfied, actionable_work_exists)` to an outcome.
///
/// Total over all six combinations and free of side effects.
pub fn route_outcome(spec_satisfied: SpecSatisfied, actionable_work_exists: bool) -> Outcome {
    match (spec_satisfied, actionable_work_exists) {
        (SpecSatisfied::Yes, _) => Outcome::Done,
        (SpecSatisfied::No | SpecSatisfied::Unverifiable, true) => Outcome::Continue,
        (SpecSatisfied::No | SpecSatisfied::Unverifiable, false) => Outcome::Stuck,
    }
}

/// Build the full decision record for a verdict.
///
/// `stuck_context` (e.g. a stagnation message) takes precedence over gap
/// descriptions when explaining a STUCK outcome.
pub fn route(verdict: &Verdict, stuck_context: Option<&str>) -> Decision {
    let outcome = route_outcome(verdict.spec_satisfied, verdict.actionable_work_exists);
    match outcome {
        Outcome::Done => Decision {
            outcome,
            reason: None,
            summary: Some(
                verdict
                    .summary
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_DONE_SUMMARY)
                    .to_string(),
            ),
        },
        Outcome::Stuck => Decision {
            outcome,
            reason: Some(stuck_reason(verdict, stuck_context)),
            summary: None,
        },
        Outcome::Continue => Decision {
            outcome,
            reason: None,
            summary: None,
        },
    }
}

fn stuck_reason(verdict: &Verdict, stuck_context: Option<&str>) -> String {
    if let Some(context) = stuck_context.map(str::trim).filter(|s| !s.is_empty()) {
        return context.to_string();
    }
    let gaps: Vec<&str> = verdict
        .gaps
        .iter()
        .map(|gap| gap.description.trim())
        .filter(|d| !d.is_empty())
        .collect();
    if gaps.is_empty() {
        DEFAULT_STUCK_REASON.to_string()
    } else {
        gaps.join("; ")
    }
}
