//! Git adapter for the act phase and code claims.
//!
//! The engine commits and merges deterministically, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::claims::{CommitInfo, DiffSummary};

/// Porcelain codes that mark an unmerged path.
const CONFLICT_CODES: &[&str] = &["UU", "AA", "DD", "AU", "UA", "DU", "UD"];

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    pub fn is_staged(&self) -> bool {
        !self.is_untracked() && !self.code.starts_with(' ')
    }

    pub fn is_unstaged(&self) -> bool {
        !self.is_untracked() && self.code.chars().nth(1).is_some_and(|c| c != ' ')
    }

    pub fn is_conflict(&self) -> bool {
        CONFLICT_CODES.contains(&self.code.as_str())
    }
}

/// Result of merging an iteration branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged,
    /// The merge was aborted; the listed paths conflicted.
    Conflict { files: Vec<String> },
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    /// True when HEAD points at a commit.
    pub fn has_commits(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status
            .success())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn commit_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        Ok(self.run(&["cat-file", "-e", &spec])?.status.success())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths currently in an unmerged state.
    pub fn conflicted_files(&self) -> Result<Vec<String>> {
        let mut files: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .filter(StatusEntry::is_conflict)
            .map(|entry| entry.path)
            .collect();
        files.sort();
        Ok(files)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// First of `base`, `base-2`, `base-3`, ... that is not an existing branch.
    pub fn unique_branch_name(&self, base: &str) -> Result<String> {
        if !self.branch_exists(base)? {
            return Ok(base.to_string());
        }
        for suffix in 2..=999 {
            let candidate = format!("{base}-{suffix}");
            if !self.branch_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(anyhow!("unable to find a free branch name for '{base}'"))
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Number of commits on `branch` not reachable from `base`.
    pub fn commits_ahead(&self, base: &str, branch: &str) -> Result<u32> {
        let range = format!("{base}..{branch}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// Commits in `base..HEAD`, newest first, at most `limit`.
    pub fn log_since(&self, base: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        let range = format!("{base}..HEAD");
        let max = format!("--max-count={limit}");
        let out = self.run_capture(&["log", "--format=%H%x1f%s%x1f%cI", &max, &range])?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\u{1f}');
                Some(CommitInfo {
                    hash: parts.next()?.to_string(),
                    subject: parts.next()?.to_string(),
                    timestamp: parts.next()?.to_string(),
                })
            })
            .collect())
    }

    /// Paths changed between `base` and HEAD, sorted.
    pub fn files_changed_since(&self, base: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", base, "HEAD"])?;
        let mut files: Vec<String> = out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    /// Added/removed line totals between `base` and HEAD.
    pub fn diff_summary_since(&self, base: &str) -> Result<DiffSummary> {
        let out = self.run_capture(&["diff", "--numstat", base, "HEAD"])?;
        Ok(parse_numstat(&out))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Record an empty commit (used to give a fresh repository a base).
    pub fn commit_empty(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "--allow-empty", "-m", message])?;
        Ok(())
    }

    /// Drop all uncommitted changes, keeping ignored files.
    #[instrument(skip_all)]
    pub fn discard_changes(&self) -> Result<()> {
        warn!("discarding uncommitted changes");
        self.run_checked(&["reset", "--hard", "HEAD"])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    /// Merge `branch` into the current branch with a merge commit.
    ///
    /// On conflict the merge is aborted and the work tree restored.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<MergeResult> {
        let out = self.run(&["merge", "--no-ff", "--no-edit", "-m", message, branch])?;
        if out.status.success() {
            info!(branch, "merged");
            return Ok(MergeResult::Merged);
        }
        let files = self.conflicted_files()?;
        if files.is_empty() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let _ = self.run(&["merge", "--abort"]);
            return Err(anyhow!("git merge {branch} failed: {}", stderr.trim()));
        }
        warn!(branch, conflicts = files.len(), "merge conflict, aborting");
        self.run_checked(&["merge", "--abort"])?;
        Ok(MergeResult::Conflict { files })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_numstat(out: &str) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for line in out.lines() {
        let mut parts = line.split('\t');
        let (Some(added), Some(removed), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        summary.files_changed += 1;
        // Binary files report "-" for both counts.
        summary.lines_added += added.parse::<u64>().unwrap_or(0);
        summary.lines_removed += removed.parse::<u64>().unwrap_or(0);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert!(e.is_untracked());
        assert_eq!(e.path, "foo.txt");
    }

    #[test]
    fn classifies_staged_unstaged_and_conflicts() {
        let staged = parse_status_line("M  src/lib.rs").expect("parse");
        let unstaged = parse_status_line(" M src/main.rs").expect("parse");
        let both = parse_status_line("UU src/conflict.rs").expect("parse");
        assert!(staged.is_staged() && !staged.is_unstaged());
        assert!(unstaged.is_unstaged() && !unstaged.is_staged());
        assert!(both.is_conflict());
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn numstat_sums_lines_and_tolerates_binary() {
        let summary = parse_numstat("3\t1\tsrc/a.rs\n-\t-\tlogo.png\n10\t0\tREADME.md\n");
        assert_eq!(
            summary,
            DiffSummary {
                files_changed: 3,
                lines_added: 13,
                lines_removed: 1,
            }
        );
    }

    #[test]
    fn unique_branch_name_appends_suffix() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        assert_eq!(git.unique_branch_name("ooda/iteration-1").expect("name"), "ooda/iteration-1");
        git.checkout_new_branch("ooda/iteration-1").expect("branch");
        assert_eq!(
            git.unique_branch_name("ooda/iteration-1").expect("name"),
            "ooda/iteration-1-2"
        );
    }

    /// Overlapping edits on two branches abort the merge and report the file.
    #[test]
    fn merge_conflict_is_aborted_and_reported() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let base = git.current_branch().expect("branch");

        git.checkout_new_branch("feature").expect("feature");
        repo.write("README.md", "feature line\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("feature edit").expect("commit"));

        git.checkout_branch(&base).expect("checkout base");
        repo.write("README.md", "base line\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("base edit").expect("commit"));

        let result = git.merge_no_ff("feature", "merge feature").expect("merge");
        assert_eq!(
            result,
            MergeResult::Conflict {
                files: vec!["README.md".to_string()]
            }
        );
        assert!(git.status_porcelain().expect("status").is_empty());
        assert!(git.branch_exists("feature").expect("exists"));
        assert!(!git.is_ancestor("feature", &base).expect("ancestor"));
    }

    #[test]
    fn log_and_diff_since_base() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let base = git.head_sha().expect("head");
        repo.write("src/a.rs", "fn a() {}\n").expect("write");
        git.add_all().expect("add");
        git.commit_staged("t1: add a").expect("commit");

        let log = git.log_since(&base, 50).expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].subject, "t1: add a");
        assert_eq!(git.files_changed_since(&base).expect("files"), vec!["src/a.rs"]);
        assert_eq!(git.diff_summary_since(&base).expect("diff").lines_added, 1);
        assert_eq!(git.commits_ahead(&base, "HEAD").expect("ahead"), 1);
    }
}
