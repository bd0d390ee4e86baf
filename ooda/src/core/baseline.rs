//! Test-result parsing and regression diffing for the act phase.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Parsed result of one test-suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: u32,
    pub failed: u32,
    pub failing: BTreeSet<String>,
    /// False when no test command is configured.
    pub ran: bool,
}

impl TestReport {
    /// Empty baseline for a repository without test infrastructure.
    pub fn not_run() -> Self {
        Self::default()
    }

    /// Failures in `self` that were absent from `baseline`.
    ///
    /// Without per-test ids the failed counts are compared instead, and a
    /// rise is reported as a synthetic `<n> additional failing test(s)` entry.
    pub fn new_failures(&self, baseline: &TestReport) -> BTreeSet<String> {
        let mut fresh: BTreeSet<String> =
            self.failing.difference(&baseline.failing).cloned().collect();
        let unnamed = self.failed.saturating_sub(self.failing.len() as u32);
        let baseline_unnamed = baseline
            .failed
            .saturating_sub(baseline.failing.len() as u32);
        if unnamed > baseline_unnamed {
            fresh.insert(format!(
                "{} additional failing test(s)",
                unnamed - baseline_unnamed
            ));
        }
        fresh
    }
}

static CARGO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (\S+) \.\.\. (ok|FAILED|ignored)").expect("cargo test regex")
});
static PYTEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(PASSED|FAILED|ERROR) (\S+)").expect("pytest regex"));
static PYTEST_VERBOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+::\S+) (PASSED|FAILED|ERROR)").expect("pytest -v regex"));

/// Parse per-test results from cargo-test or pytest style output.
///
/// `exit_ok` fills in a single unnamed failure when the command failed but
/// printed nothing recognizable.
pub fn parse_test_output(output: &str, exit_ok: bool) -> TestReport {
    let mut report = TestReport {
        ran: true,
        ..TestReport::default()
    };
    let mut passed = BTreeSet::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(caps) = CARGO_RE.captures(line) {
            record(&mut report, &mut passed, &caps[1], &caps[2] == "FAILED", &caps[2] == "ok");
        } else if let Some(caps) = PYTEST_RE.captures(line) {
            record(&mut report, &mut passed, &caps[2], &caps[1] != "PASSED", &caps[1] == "PASSED");
        } else if let Some(caps) = PYTEST_VERBOSE_RE.captures(line) {
            record(&mut report, &mut passed, &caps[1], &caps[2] != "PASSED", &caps[2] == "PASSED");
        }
    }
    report.passed = passed.len() as u32;
    report.failed = report.failing.len() as u32;
    if !exit_ok && report.failed == 0 {
        report.failed = 1;
    }
    report
}

fn record(
    report: &mut TestReport,
    passed: &mut BTreeSet<String>,
    name: &str,
    failed: bool,
    ok: bool,
) {
    if failed {
        passed.remove(name);
        report.failing.insert(name.to_string());
    } else if ok && !report.failing.contains(name) {
        passed.insert(name.to_string());
    }
}
