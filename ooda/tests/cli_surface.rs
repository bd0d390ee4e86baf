//! CLI tests for the `ooda` binary surface.
//!
//! Spawns the binary and checks exit codes and the reporting commands that
//! do not need an agent.

use std::process::{Command, Output};

use ooda::exit_codes;
use ooda::test_support::TestRepo;

fn ooda(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ooda"))
        .current_dir(dir)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn ooda")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_without_state_reports_no_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = ooda(temp.path(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(stdout(&out).contains("No runs recorded."));
    assert!(!temp.path().join(".ooda").exists());
}

#[test]
fn run_outside_git_repository_halts() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("SPEC.md"), "# Thing\n").expect("spec");
    let out = ooda(temp.path(), &["run"]);
    assert_eq!(out.status.code(), Some(exit_codes::HALT));
    assert!(String::from_utf8_lossy(&out.stderr).contains("not a git repository"));
}

#[test]
fn run_without_spec_file_halts() {
    let repo = TestRepo::new().expect("repo");
    let out = ooda(repo.root(), &["run", "--spec", "missing.md"]);
    assert_eq!(out.status.code(), Some(exit_codes::HALT));
    assert!(String::from_utf8_lossy(&out.stderr).contains("missing.md"));
}

#[test]
fn resume_without_runs_halts() {
    let repo = TestRepo::new().expect("repo");
    let out = ooda(repo.root(), &["resume"]);
    assert_eq!(out.status.code(), Some(exit_codes::HALT));
}

#[test]
fn input_is_queued_for_next_run() {
    let repo = TestRepo::new().expect("repo");
    let out = ooda(repo.root(), &["input", "prefer sqlite"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(stdout(&out).contains("Queued comment #1 for the next run"));
    assert!(repo.root().join(".ooda/config.toml").exists());

    let out = ooda(repo.root(), &["input", "--kind", "pause"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(stdout(&out).contains("Queued pause #2"));

    let out = ooda(repo.root(), &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(stdout(&out).contains("No runs recorded."));

    let out = ooda(repo.root(), &["history", "-n", "5"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(stdout(&out).contains("No runs recorded."));
}

#[test]
fn empty_comment_is_rejected() {
    let repo = TestRepo::new().expect("repo");
    let out = ooda(repo.root(), &["input", "   "]);
    assert_eq!(out.status.code(), Some(exit_codes::HALT));
}
