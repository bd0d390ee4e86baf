//! Test suite seam used by the act phase for baselines and verification.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::baseline::{TestReport, parse_test_output};
use crate::io::process::run_command_with_timeout;

const TEST_OUTPUT_LIMIT: usize = 8 * 1024 * 1024;

pub trait TestRunner {
    /// Run the suite and report per-test results.
    fn run(&self) -> Result<TestReport>;
}

/// Runs the configured test argv in the repository root.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
        }
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run(&self) -> Result<TestReport> {
        let Some((program, args)) = self.command.split_first() else {
            debug!("no test command configured");
            return Ok(TestReport::not_run());
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let output = match run_command_with_timeout(cmd, None, self.timeout, TEST_OUTPUT_LIMIT) {
            Ok(output) => output,
            Err(err)
                if err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound) =>
            {
                warn!(program = %program, "test command not found, treating as no tests");
                return Ok(TestReport::not_run());
            }
            Err(err) => return Err(err).context("run tests"),
        };
        if output.timed_out {
            return Err(anyhow!(output.failure_message("tests", self.timeout)));
        }
        let mut text = output.stdout_text();
        text.push('\n');
        text.push_str(&output.stderr_text());
        let report = parse_test_output(&text, output.status.success());
        debug!(passed = report.passed, failed = report.failed, "tests finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_yields_not_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(Vec::new(), temp.path(), Duration::from_secs(5));
        let report = runner.run().expect("run");
        assert!(!report.ran);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn missing_binary_yields_not_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(
            vec!["ooda-no-such-test-binary".to_string()],
            temp.path(),
            Duration::from_secs(5),
        );
        assert!(!runner.run().expect("run").ran);
    }

    #[test]
    fn parses_cargo_style_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'test a::ok_one ... ok'; echo 'test a::bad ... FAILED'; exit 101".to_string(),
            ],
            temp.path(),
            Duration::from_secs(5),
        );
        let report = runner.run().expect("run");
        assert_eq!(report.passed, 1);
        assert!(report.failing.contains("a::bad"));
    }
}
