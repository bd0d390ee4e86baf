//! Stagnation detection over recent iteration history.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::Verdict;

pub const DEFAULT_WINDOW: usize = 5;
pub const DEFAULT_THRESHOLD: usize = 2;

/// The subset of an iteration record the detector looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSignature {
    pub number: u32,
    pub intent: String,
    pub open_tasks: Option<u32>,
    pub failing_tests: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stagnation {
    /// The same failing test recurred in consecutive iterations.
    RepeatedFailure { test: String, iterations: usize },
    /// The same intent recurred with no change in open-task count.
    RepeatedIntent { intent: String, iterations: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagnationFlag {
    pub signature: Stagnation,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDetector {
    pub window: usize,
    pub threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl LoopDetector {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self { window, threshold }
    }

    /// Inspect `history` (oldest first) and flag the first stagnation signature found.
    ///
    /// Only the trailing `window` records are considered; a signature must span
    /// at least `threshold` consecutive trailing records.
    pub fn detect(&self, history: &[IterationSignature]) -> Option<StagnationFlag> {
        if self.threshold == 0 || history.is_empty() {
            return None;
        }
        let start = history.len().saturating_sub(self.window);
        let recent = &history[start..];
        if recent.len() < self.threshold {
            return None;
        }
        self.repeated_failure(recent)
            .or_else(|| self.repeated_intent(recent))
    }

    fn repeated_failure(&self, recent: &[IterationSignature]) -> Option<StagnationFlag> {
        let last = recent.last()?;
        for test in &last.failing_tests {
            let run = recent
                .iter()
                .rev()
                .take_while(|sig| sig.failing_tests.contains(test))
                .count();
            if run >= self.threshold {
                return Some(StagnationFlag {
                    message: format!(
                        "test '{test}' has failed in {run} consecutive iterations; create an investigation task instead of repeating the previous approach"
                    ),
                    signature: Stagnation::RepeatedFailure {
                        test: test.clone(),
                        iterations: run,
                    },
                });
            }
        }
        None
    }

    fn repeated_intent(&self, recent: &[IterationSignature]) -> Option<StagnationFlag> {
        let last = recent.last()?;
        let intent = normalize_intent(&last.intent);
        if intent.is_empty() {
            return None;
        }
        let run = recent
            .iter()
            .rev()
            .take_while(|sig| normalize_intent(&sig.intent) == intent)
            .take_while(|sig| sig.open_tasks.is_some() && sig.open_tasks == last.open_tasks)
            .count();
        if run < self.threshold {
            return None;
        }
        Some(StagnationFlag {
            message: format!(
                "intent \"{}\" repeated in {run} consecutive iterations with no change in open tasks; create an investigation task instead of repeating the previous approach",
                last.intent.trim()
            ),
            signature: Stagnation::RepeatedIntent { intent, iterations: run },
        })
    }
}

/// Lowercase, strip punctuation, and collapse whitespace.
pub fn normalize_intent(intent: &str) -> String {
    intent
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of checking a verdict against an active stagnation flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Pass,
    /// The verdict repeats the stalled approach; its work no longer counts as actionable.
    Demoted { reason: String },
}

/// Keep `actionable_work_exists` only if the verdict breaks the stalled pattern.
///
/// A verdict breaks the pattern by creating a new task (the investigation) or
/// by planning a different intent than the flagged one.
pub fn gate_verdict(verdict: &mut Verdict, flag: Option<&StagnationFlag>) -> Gate {
    let Some(flag) = flag else {
        return Gate::Pass;
    };
    if !verdict.actionable_work_exists || !verdict.new_tasks.is_empty() {
        return Gate::Pass;
    }
    let repeats = match &flag.signature {
        Stagnation::RepeatedIntent { intent, .. } => {
            normalize_intent(&verdict.iteration_plan.intent) == *intent
        }
        Stagnation::RepeatedFailure { .. } => true,
    };
    if !repeats {
        return Gate::Pass;
    }
    verdict.actionable_work_exists = false;
    Gate::Demoted {
        reason: format!("stagnation: {}", flag.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Confidence, IterationPlan, NewTask, SpecSatisfied};

    fn sig(number: u32, intent: &str, open: u32, failing: &[&str]) -> IterationSignature {
        IterationSignature {
            number,
            intent: intent.to_string(),
            open_tasks: Some(open),
            failing_tests: failing.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Threshold 2: three identical iterations are flagged once the second is recorded.
    #[test]
    fn threshold_two_flags_on_second_repetition() {
        let detector = LoopDetector::new(5, 2);
        let history = vec![
            sig(1, "Implement login form", 3, &[]),
            sig(2, "implement  login form!", 3, &[]),
            sig(3, "Implement login form", 3, &[]),
        ];
        assert_eq!(detector.detect(&history[..1]), None);
        let flag = detector.detect(&history[..2]).expect("flag after second");
        assert!(matches!(
            flag.signature,
            Stagnation::RepeatedIntent { iterations: 2, .. }
        ));
        assert!(detector.detect(&history).is_some());
    }

    #[test]
    fn threshold_three_waits_for_third_repetition() {
        let detector = LoopDetector::new(5, 3);
        let history = vec![
            sig(1, "Implement login form", 3, &[]),
            sig(2, "Implement login form", 3, &[]),
            sig(3, "Implement login form", 3, &[]),
        ];
        assert_eq!(detector.detect(&history[..2]), None);
        assert!(detector.detect(&history).is_some());
    }

    #[test]
    fn changed_open_task_count_is_progress() {
        let detector = LoopDetector::default();
        let history = vec![
            sig(1, "Implement login form", 3, &[]),
            sig(2, "Implement login form", 2, &[]),
        ];
        assert_eq!(detector.detect(&history), None);
    }

    #[test]
    fn repeated_failing_test_is_flagged() {
        let detector = LoopDetector::default();
        let history = vec![
            sig(1, "a", 3, &["auth::login"]),
            sig(2, "b", 2, &["auth::login", "db::pool"]),
        ];
        let flag = detector.detect(&history).expect("flag");
        assert_eq!(
            flag.signature,
            Stagnation::RepeatedFailure {
                test: "auth::login".to_string(),
                iterations: 2
            }
        );
    }

    #[test]
    fn window_limits_history() {
        let detector = LoopDetector::new(1, 2);
        let history = vec![sig(1, "same", 1, &[]), sig(2, "same", 1, &[])];
        assert_eq!(detector.detect(&history), None);
    }

    fn verdict(intent: &str, new_tasks: Vec<NewTask>) -> Verdict {
        Verdict {
            spec_satisfied: SpecSatisfied::No,
            actionable_work_exists: true,
            confidence: Confidence::Medium,
            task_updates: Vec::new(),
            new_tasks,
            gaps: Vec::new(),
            iteration_plan: IterationPlan {
                intent: intent.to_string(),
                tasks: Vec::new(),
                approach: String::new(),
            },
            learnings: Vec::new(),
            deprecated_learnings: Vec::new(),
            summary: None,
        }
    }

    #[test]
    fn gate_demotes_repeated_plan_without_investigation() {
        let flag = LoopDetector::default()
            .detect(&[sig(1, "Fix login", 2, &[]), sig(2, "Fix login", 2, &[])])
            .expect("flag");

        let mut repeat = verdict("fix login", Vec::new());
        assert!(matches!(
            gate_verdict(&mut repeat, Some(&flag)),
            Gate::Demoted { .. }
        ));
        assert!(!repeat.actionable_work_exists);

        let mut investigate = verdict(
            "fix login",
            vec![NewTask {
                title: "Investigate login loop".to_string(),
                description: "why does the fix not stick".to_string(),
                parent_id: None,
                priority: None,
            }],
        );
        assert_eq!(gate_verdict(&mut investigate, Some(&flag)), Gate::Pass);
        assert!(investigate.actionable_work_exists);

        let mut different = verdict("write migration", Vec::new());
        assert_eq!(gate_verdict(&mut different, Some(&flag)), Gate::Pass);
    }

    #[test]
    fn intent_normalization_folds_non_ascii_case() {
        assert_eq!(normalize_intent("Ärger beheben!"), normalize_intent("ÄRGER   beheben"));
        assert_eq!(normalize_intent("Добавить API"), "добавить api");
    }
}
