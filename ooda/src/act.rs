//! ACT: execute the planned tasks on an iteration branch and merge it back.
//!
//! The coordinator walks `Setup -> Executing -> Verifying -> Committed ... ->
//! Finalizing -> Done | Blocked`. Tasks run strictly one after another.
//! Every transition is checkpointed so an interrupted iteration can resume
//! without redoing committed tasks.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::baseline::TestReport;
use crate::core::claims::PendingMerge;
use crate::core::learnings::Learning;
use crate::core::types::{ActOutput, ActStatus, Task, TaskStatus};
use crate::error::{HaltKind, RetriesExhausted, StructuralHalt};
use crate::io::agent::{Agent, AgentRequest, AgentRole, invoke_and_read, write_schema};
use crate::io::config::OodaConfig;
use crate::io::git::{Git, MergeResult};
use crate::io::paths::OodaPaths;
use crate::io::prompt::{ActPromptInputs, render_act_prompt};
use crate::io::retry::retry_transient;
use crate::io::signal::CancelFlag;
use crate::io::store::{
    ActCheckpoint, AgentOutputRecord, IterationRecord, RunRecord, Store,
};
use crate::io::test_runner::TestRunner;
use crate::io::tracker::{TaskChange, Tracker};
use crate::io::transcripts::TranscriptPaths;
use crate::validate::{ACT_OUTPUT_SCHEMA, validate_act_output};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActState {
    Setup,
    Executing(String),
    Verifying(String),
    Committed(String),
    Finalizing,
    Done,
    Blocked,
}

impl fmt::Display for ActState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => f.write_str("SETUP"),
            Self::Executing(task) => write!(f, "EXECUTING({task})"),
            Self::Verifying(task) => write!(f, "VERIFYING({task})"),
            Self::Committed(task) => write!(f, "COMMITTED({task})"),
            Self::Finalizing => f.write_str("FINALIZING"),
            Self::Done => f.write_str("DONE"),
            Self::Blocked => f.write_str("BLOCKED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Completed; `commit` is `None` when the task changed nothing.
    Completed { commit: Option<String> },
    Blocked { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActReport {
    pub state: ActState,
    pub transitions: Vec<String>,
    pub branch: String,
    pub tasks: Vec<TaskRecord>,
    pub merged: bool,
    pub pending_merge: Option<PendingMerge>,
    /// Failures the last verification saw that the baseline did not.
    pub failing_tests: BTreeSet<String>,
    /// Set when the baseline run errored; every failure then counts as new.
    pub baseline_error: Option<String>,
    /// Learnings proposed by task outputs.
    pub learnings: Vec<String>,
}

/// Collaborators the coordinator drives.
pub struct ActContext<'a> {
    pub git: &'a Git,
    pub agent: &'a dyn Agent,
    pub tracker: &'a dyn Tracker,
    pub tests: &'a dyn TestRunner,
    pub store: &'a Store,
    pub config: &'a OodaConfig,
    pub paths: &'a OodaPaths,
    pub cancel: &'a CancelFlag,
}

/// One iteration's worth of work.
pub struct ActRequest<'a> {
    pub run: &'a RunRecord,
    pub iteration: &'a IterationRecord,
    /// Eligible tasks in plan order.
    pub tasks: Vec<Task>,
    pub intent: &'a str,
    pub approach: &'a str,
    pub spec: &'a str,
    pub learnings: &'a [Learning],
}

pub struct ActCoordinator<'a> {
    ctx: &'a ActContext<'a>,
    request: ActRequest<'a>,
    state: ActState,
    transitions: Vec<String>,
}

impl<'a> ActCoordinator<'a> {
    pub fn new(ctx: &'a ActContext<'a>, request: ActRequest<'a>) -> Self {
        Self {
            ctx,
            request,
            state: ActState::Setup,
            transitions: vec![ActState::Setup.to_string()],
        }
    }

    fn transition(&mut self, next: ActState) {
        info!(from = %self.state, to = %next, "act transition");
        self.transitions.push(next.to_string());
        self.state = next;
    }

    fn checkpoint(&self, task_id: Option<&str>, state: &str, detail: &str, sha: Option<&str>) -> Result<()> {
        self.ctx.store.checkpoint(
            self.request.iteration.id,
            &ActCheckpoint {
                task_id: task_id.map(str::to_string),
                state: state.to_string(),
                detail: detail.to_string(),
                commit_sha: sha.map(str::to_string),
            },
        )
    }

    #[instrument(skip_all, fields(run_id = %self.request.run.id, iteration = self.request.iteration.number, tasks = self.request.tasks.len()))]
    pub fn run(mut self) -> Result<ActReport> {
        let ctx = self.ctx;
        let milestone = self.request.run.milestone_branch.clone().ok_or_else(|| {
            StructuralHalt::new(HaltKind::InvalidState, "run has no milestone branch")
        })?;
        let prior = ctx.store.checkpoints(self.request.iteration.id)?;

        let branch = self.setup(&milestone, &prior)?;
        let (baseline, baseline_error) = match ctx.tests.run() {
            Ok(report) => (report, None),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "baseline test run failed");
                self.checkpoint(None, "baseline-error", &message, None)?;
                (TestReport::not_run(), Some(message))
            }
        };
        info!(passed = baseline.passed, failed = baseline.failed, ran = baseline.ran, "baseline captured");

        let mut records = Vec::new();
        let mut learnings = Vec::new();
        let mut failing_tests = BTreeSet::new();
        let tasks = std::mem::take(&mut self.request.tasks);
        for task in &tasks {
            if let Some(done) = finished_task(&prior, &task.id) {
                info!(task_id = %task.id, "task already finished in an earlier attempt");
                if let TaskOutcome::Blocked { reason } = &done.outcome {
                    self.mark_blocked(&task.id, reason)?;
                }
                records.push(done);
                continue;
            }
            ctx.cancel.check()?;
            let (record, report, task_learnings) = self.execute_task(task, &baseline)?;
            if let Some(report) = report {
                failing_tests = report.new_failures(&baseline);
            }
            learnings.extend(task_learnings);
            records.push(record);
        }

        self.transition(ActState::Finalizing);
        let (merged, pending_merge) = self.finalize(&milestone, &branch, &records)?;
        self.checkpoint(None, "finalized", &branch, None)?;

        let any_blocked = records
            .iter()
            .any(|r| matches!(r.outcome, TaskOutcome::Blocked { .. }));
        let final_state = if any_blocked || pending_merge.is_some() {
            ActState::Blocked
        } else {
            ActState::Done
        };
        self.transition(final_state.clone());
        Ok(ActReport {
            state: final_state,
            transitions: self.transitions,
            branch,
            tasks: records,
            merged,
            pending_merge,
            failing_tests,
            baseline_error,
            learnings,
        })
    }

    /// Check out the milestone, clear merged blockers, and open the iteration branch.
    fn setup(&mut self, milestone: &str, prior: &[ActCheckpoint]) -> Result<String> {
        let ctx = self.ctx;
        let git = ctx.git;
        let resumed = prior
            .iter()
            .rev()
            .find(|c| c.state == "setup")
            .map(|c| c.detail.clone());
        if resumed.is_some() {
            git.discard_changes()?;
        }

        git.checkout_branch(milestone)?;
        for stored in ctx.store.pending_merges(&self.request.run.id)? {
            let branch = &stored.merge.branch;
            if !git.branch_exists(branch)? || git.is_ancestor(branch, milestone)? {
                info!(branch = %branch, "pending merge resolved");
                ctx.store.resolve_pending_merge(stored.id)?;
            }
        }

        if let Some(branch) = resumed {
            if git.branch_exists(&branch)? {
                git.checkout_branch(&branch)?;
                info!(branch = %branch, "resumed iteration branch");
                return Ok(branch);
            }
        }
        let base = format!(
            "{}/iteration-{}",
            ctx.config.branch_prefix, self.request.iteration.number
        );
        let branch = git.unique_branch_name(&base)?;
        git.checkout_new_branch(&branch)?;
        self.checkpoint(None, "setup", &branch, None)?;
        Ok(branch)
    }

    fn execute_task(
        &mut self,
        task: &Task,
        baseline: &TestReport,
    ) -> Result<(TaskRecord, Option<TestReport>, Vec<String>)> {
        let ctx = self.ctx;
        let max_attempts = 1 + ctx.config.act.fix_attempts;
        let mut failures: Vec<String> = Vec::new();
        let mut transcript_seq = 0u32;
        let mut last_report = None;

        for attempt in 1..=max_attempts {
            self.transition(ActState::Executing(task.id.clone()));
            self.checkpoint(Some(&task.id), "executing", &format!("attempt {attempt}"), None)?;

            let output = match self.invoke(task, &failures, &mut transcript_seq) {
                Ok(output) => output,
                Err(err) => {
                    let Some(exhausted) = err.downcast_ref::<RetriesExhausted>() else {
                        return Err(err);
                    };
                    let reason = format!("agent unavailable: {}", exhausted.last);
                    ctx.git.discard_changes()?;
                    return Ok((self.block(task, &reason, String::new())?, last_report, Vec::new()));
                }
            };

            if output.status == ActStatus::Blocked {
                ctx.git.discard_changes()?;
                let reason = output
                    .blocker_reason
                    .clone()
                    .unwrap_or_else(|| output.summary.clone());
                let record = self.block(task, &reason, output.summary.clone())?;
                return Ok((record, last_report, output.learnings));
            }

            self.transition(ActState::Verifying(task.id.clone()));
            let report = match ctx.tests.run() {
                Ok(report) => report,
                Err(err) => {
                    ctx.git.discard_changes()?;
                    let reason = format!("verification failed: {err:#}");
                    return Ok((self.block(task, &reason, String::new())?, last_report, Vec::new()));
                }
            };
            let fresh = report.new_failures(baseline);
            last_report = Some(report);
            if fresh.is_empty() {
                let record = self.commit(task, &output)?;
                return Ok((record, last_report, output.learnings));
            }
            warn!(task_id = %task.id, attempt, new_failures = fresh.len(), "task introduced test failures");
            failures = fresh.into_iter().collect();
        }

        ctx.git.discard_changes()?;
        let reason = format!("failing tests: {}", failures.join(", "));
        Ok((self.block(task, &reason, String::new())?, last_report, Vec::new()))
    }

    fn invoke(&self, task: &Task, failures: &[String], seq: &mut u32) -> Result<ActOutput> {
        let ctx = self.ctx;
        let req = &self.request;
        let agent_cfg = &ctx.config.agent;
        let prompt = render_act_prompt(
            &ActPromptInputs {
                workdir: ctx.git.workdir().display().to_string(),
                task: task.clone(),
                intent: req.intent.to_string(),
                approach: req.approach.to_string(),
                spec: req.spec.to_string(),
                learnings: req.learnings.to_vec(),
                failures: failures.to_vec(),
            },
            agent_cfg.prompt_budget_bytes,
        )?;
        let schema_path = ctx.paths.schemas_dir.join("act_output.schema.json");
        write_schema(&schema_path, ACT_OUTPUT_SCHEMA)?;

        let (raw, transcript) = retry_transient(
            &ctx.config.retry.policy(),
            &format!("act {}", task.id),
            ctx.cancel,
            || {
                *seq += 1;
                let transcript = TranscriptPaths::new(
                    &ctx.paths.transcripts_dir,
                    &req.run.id,
                    req.iteration.number,
                    AgentRole::Act.as_str(),
                    Some(&task.id),
                    *seq,
                );
                transcript.write_prompt(&prompt)?;
                transcript.clear_output()?;
                let raw = invoke_and_read(
                    ctx.agent,
                    &AgentRequest {
                        role: AgentRole::Act,
                        task_id: Some(task.id.clone()),
                        workdir: ctx.git.workdir().to_path_buf(),
                        prompt: prompt.clone(),
                        schema_path: schema_path.clone(),
                        output_path: transcript.output_path.clone(),
                        log_path: transcript.log_path.clone(),
                        timeout: Duration::from_secs(agent_cfg.timeout_secs),
                        output_limit_bytes: agent_cfg.output_limit_bytes,
                    },
                )?;
                Ok((raw, transcript))
            },
        )?;

        let output = validate_act_output(&raw, &task.id)?;
        ctx.store.insert_agent_output(&AgentOutputRecord {
            iteration_id: req.iteration.id,
            role: AgentRole::Act.as_str().to_string(),
            task_id: Some(task.id.clone()),
            transcript_path: transcript.output_path.display().to_string(),
            summary: output.summary.clone(),
            parsed: serde_json::to_string(&output).context("serialize act output")?,
        })?;
        Ok(output)
    }

    fn commit(&mut self, task: &Task, output: &ActOutput) -> Result<TaskRecord> {
        let ctx = self.ctx;
        let git = ctx.git;
        git.add_all()?;
        let message = format!("{}: {}\n\n{}", task.id, task.title, output.summary.trim());
        let commit = if git.commit_staged(&message)? {
            Some(git.head_sha()?)
        } else {
            None
        };
        self.transition(ActState::Committed(task.id.clone()));
        let (state, note) = match &commit {
            Some(sha) => (
                "committed",
                format!("Completed in commit {}: {}", short(sha), output.summary.trim()),
            ),
            None => (
                "completed",
                format!("Completed with no code changes: {}", output.summary.trim()),
            ),
        };
        self.checkpoint(Some(&task.id), state, &output.summary, commit.as_deref())?;
        self.comment(&task.id, &note)?;
        Ok(TaskRecord {
            task_id: task.id.clone(),
            outcome: TaskOutcome::Completed { commit },
            summary: output.summary.clone(),
        })
    }

    fn block(&self, task: &Task, reason: &str, summary: String) -> Result<TaskRecord> {
        let ctx = self.ctx;
        warn!(task_id = %task.id, reason, "task blocked");
        self.checkpoint(Some(&task.id), "blocked", reason, None)?;
        self.mark_blocked(&task.id, reason)?;
        Ok(TaskRecord {
            task_id: task.id.clone(),
            outcome: TaskOutcome::Blocked {
                reason: reason.to_string(),
            },
            summary,
        })
    }

    /// Set the tracker status to blocked.
    ///
    /// Runs after the `blocked` checkpoint, so a failure here leaves the
    /// iteration open and a resumed act repeats the update.
    fn mark_blocked(&self, task_id: &str, reason: &str) -> Result<()> {
        let ctx = self.ctx;
        let change = TaskChange {
            status: Some(TaskStatus::Blocked),
            reason: Some(reason.to_string()),
            ..TaskChange::default()
        };
        retry_transient(&ctx.config.retry.policy(), "tracker block", ctx.cancel, || {
            ctx.tracker.update(task_id, &change)
        })
        .with_context(|| format!("mark {task_id} blocked in the tracker"))
    }

    fn comment(&self, task_id: &str, text: &str) -> Result<()> {
        let ctx = self.ctx;
        retry_transient(&ctx.config.retry.policy(), "tracker comment", ctx.cancel, || {
            ctx.tracker.comment(task_id, text)
        })
        .with_context(|| format!("comment on {task_id}"))
    }

    /// Merge the iteration branch into the milestone, or record why it could not be.
    fn finalize(
        &self,
        milestone: &str,
        branch: &str,
        records: &[TaskRecord],
    ) -> Result<(bool, Option<PendingMerge>)> {
        let ctx = self.ctx;
        let git = ctx.git;
        git.checkout_branch(milestone)?;
        if git.commits_ahead(milestone, branch)? == 0 {
            info!(branch, "iteration branch has no commits, deleting");
            git.delete_branch(branch)?;
            return Ok((false, None));
        }
        let message = format!("Merge {branch}: {}", self.request.intent.trim());
        match git.merge_no_ff(branch, &message)? {
            MergeResult::Merged => {
                git.delete_branch(branch)?;
                Ok((true, None))
            }
            MergeResult::Conflict { files } => {
                let merge = PendingMerge {
                    branch: branch.to_string(),
                    iteration: self.request.iteration.number,
                    reason: format!("merge conflict on {branch}"),
                    conflicts: files,
                };
                ctx.store.add_pending_merge(&self.request.run.id, &merge)?;
                let note = format!(
                    "Blocked: merge conflict on {branch} ({})",
                    merge.conflicts.join(", ")
                );
                for record in records {
                    if let TaskOutcome::Completed { commit: Some(_) } = record.outcome {
                        self.comment(&record.task_id, &note)?;
                    }
                }
                Ok((false, Some(merge)))
            }
        }
    }
}

/// Result of a task that reached a terminal checkpoint in an earlier attempt.
fn finished_task(prior: &[ActCheckpoint], task_id: &str) -> Option<TaskRecord> {
    let last = prior
        .iter()
        .rev()
        .find(|c| c.task_id.as_deref() == Some(task_id))?;
    let outcome = match last.state.as_str() {
        "committed" | "completed" => TaskOutcome::Completed {
            commit: last.commit_sha.clone(),
        },
        "blocked" => TaskOutcome::Blocked {
            reason: last.detail.clone(),
        },
        _ => return None,
    };
    Some(TaskRecord {
        task_id: task_id.to_string(),
        outcome,
        summary: last.detail.clone(),
    })
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(10)]
}
