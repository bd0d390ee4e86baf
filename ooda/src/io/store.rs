//! Durable run and iteration state in `.ooda/ooda.db` (SQLite).
//!
//! The store holds everything needed to resume an interrupted run: the run
//! row, spec versions, iteration rows, validated agent outputs, reconcile
//! marks, act checkpoints, pending merges, and the human input queue.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::claims::{HumanInput, PendingMerge};
use crate::core::types::{HumanInputKind, IterationOutcome, RunStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    spec_path TEXT NOT NULL,
    spec_content TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    root_task_id TEXT,
    milestone_branch TEXT,
    base_commit TEXT,
    stop_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

CREATE TABLE IF NOT EXISTS spec_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(id),
    content TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS iterations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(id),
    number INTEGER NOT NULL,
    intent TEXT NOT NULL DEFAULT '',
    outcome TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    open_tasks INTEGER,
    failing_tests TEXT NOT NULL DEFAULT '[]',
    UNIQUE(run_id, number)
);

CREATE TABLE IF NOT EXISTS agent_outputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    iteration_id INTEGER NOT NULL REFERENCES iterations(id),
    role TEXT NOT NULL,
    task_id TEXT,
    transcript_path TEXT NOT NULL,
    summary TEXT NOT NULL,
    parsed TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS human_inputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    consumed_at TEXT,
    consumed_in_iteration INTEGER
);

CREATE TABLE IF NOT EXISTS reconcile_marks (
    iteration_id INTEGER NOT NULL REFERENCES iterations(id),
    key TEXT NOT NULL,
    op TEXT NOT NULL,
    created_task_id TEXT,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (iteration_id, key)
);

CREATE TABLE IF NOT EXISTS gaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    iteration_id INTEGER NOT NULL REFERENCES iterations(id),
    description TEXT NOT NULL,
    severity TEXT NOT NULL,
    task_id TEXT
);

CREATE TABLE IF NOT EXISTS act_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    iteration_id INTEGER NOT NULL REFERENCES iterations(id),
    task_id TEXT,
    state TEXT NOT NULL,
    detail TEXT NOT NULL DEFAULT '',
    commit_sha TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_merges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(id),
    branch TEXT NOT NULL,
    iteration_number INTEGER NOT NULL,
    reason TEXT NOT NULL,
    conflicts TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
";

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    pub spec_path: String,
    pub spec_content: String,
    pub status: RunStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub root_task_id: Option<String>,
    pub milestone_branch: Option<String>,
    pub base_commit: Option<String>,
    pub stop_reason: Option<String>,
}

/// Fields supplied when a run is first recorded.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub id: &'a str,
    pub spec_path: &'a str,
    pub spec_content: &'a str,
    pub root_task_id: &'a str,
    pub milestone_branch: &'a str,
    pub base_commit: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRecord {
    pub id: i64,
    pub run_id: String,
    pub number: u32,
    pub intent: String,
    pub outcome: IterationOutcome,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub open_tasks: Option<u32>,
    pub failing_tests: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutputRecord {
    pub iteration_id: i64,
    pub role: String,
    pub task_id: Option<String>,
    pub transcript_path: String,
    pub summary: String,
    pub parsed: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActCheckpoint {
    pub task_id: Option<String>,
    pub state: String,
    pub detail: String,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPendingMerge {
    pub id: i64,
    pub merge: PendingMerge,
}

/// Per-task results across a run, for summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcomes {
    pub completed: Vec<String>,
    pub blocked: Vec<(String, String)>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at `path`, enabling WAL and creating tables.
    pub fn open(path: &Path) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("set WAL mode")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        debug!("store opened");
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub fn run_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .context("query run existence")?;
        Ok(count > 0)
    }

    /// Record a new running run and its first spec version.
    pub fn create_run(&self, new: &NewRun<'_>) -> Result<RunRecord> {
        let started_at = now_rfc3339();
        let tx = self.conn.unchecked_transaction().context("begin create run")?;
        tx.execute(
            "INSERT INTO runs (id, spec_path, spec_content, status, started_at, root_task_id, milestone_branch, base_commit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.id,
                new.spec_path,
                new.spec_content,
                RunStatus::Running.as_str(),
                started_at,
                new.root_task_id,
                new.milestone_branch,
                new.base_commit,
            ],
        )
        .with_context(|| format!("insert run {}", new.id))?;
        tx.execute(
            "INSERT INTO spec_versions (run_id, content, sha256, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![new.id, new.spec_content, sha256_hex(new.spec_content), started_at],
        )
        .context("insert initial spec version")?;
        tx.commit().context("commit create run")?;
        info!(run_id = new.id, "run recorded");
        self.get_run(new.id)?
            .ok_or_else(|| anyhow!("run {} vanished after insert", new.id))
    }

    pub fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [id],
                run_row,
            )
            .optional()
            .with_context(|| format!("query run {id}"))?;
        row.map(RawRun::into_record).transpose()
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>> {
        Ok(self.list_runs(1)?.into_iter().next())
    }

    /// Most recent run that has not reached a terminal status.
    pub fn latest_running_run(&self) -> Result<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running'
                     ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                [],
                run_row,
            )
            .optional()
            .context("query running run")?;
        row.map(RawRun::into_record).transpose()
    }

    /// Runs newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1"
            ))
            .context("prepare list runs")?;
        let rows = stmt
            .query_map([limit as i64], run_row)
            .context("query runs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read runs")?;
        rows.into_iter().map(RawRun::into_record).collect()
    }

    /// Set run status. Terminal statuses also stamp `ended_at`.
    pub fn set_run_status(&self, id: &str, status: RunStatus, reason: Option<&str>) -> Result<()> {
        let ended_at = status.is_terminal().then(now_rfc3339);
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = ?2, stop_reason = ?3, ended_at = ?4 WHERE id = ?1",
                params![id, status.as_str(), reason, ended_at],
            )
            .with_context(|| format!("update run {id}"))?;
        if changed == 0 {
            return Err(anyhow!("unknown run '{id}'"));
        }
        info!(run_id = id, status = status.as_str(), "run status updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spec versions
    // ------------------------------------------------------------------

    /// Latest recorded spec content and its sha256.
    pub fn latest_spec(&self, run_id: &str) -> Result<Option<(String, String)>> {
        self.conn
            .query_row(
                "SELECT content, sha256 FROM spec_versions WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("query latest spec")
    }

    /// Append a spec version when `content` differs from the latest. Returns true if recorded.
    pub fn record_spec_version(&self, run_id: &str, content: &str) -> Result<bool> {
        let sha = sha256_hex(content);
        if self
            .latest_spec(run_id)?
            .is_some_and(|(_, latest)| latest == sha)
        {
            return Ok(false);
        }
        self.conn
            .execute(
                "INSERT INTO spec_versions (run_id, content, sha256, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, content, sha, now_rfc3339()],
            )
            .context("insert spec version")?;
        info!(run_id, sha = %&sha[..12], "spec version recorded");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Iterations
    // ------------------------------------------------------------------

    pub fn next_iteration_number(&self, run_id: &str) -> Result<u32> {
        let max: Option<u32> = self
            .conn
            .query_row(
                "SELECT MAX(number) FROM iterations WHERE run_id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .context("query max iteration")?;
        Ok(max.map_or(1, |n| n + 1))
    }

    /// Insert an `incomplete` iteration row for `number`.
    pub fn start_iteration(&self, run_id: &str, number: u32) -> Result<IterationRecord> {
        self.conn
            .execute(
                "INSERT INTO iterations (run_id, number, outcome, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, number, IterationOutcome::Incomplete.as_str(), now_rfc3339()],
            )
            .with_context(|| format!("insert iteration {number} for {run_id}"))?;
        let id = self.conn.last_insert_rowid();
        debug!(run_id, number, id, "iteration started");
        self.get_iteration(id)
    }

    pub fn get_iteration(&self, id: i64) -> Result<IterationRecord> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {ITERATION_COLUMNS} FROM iterations WHERE id = ?1"),
                [id],
                iteration_row,
            )
            .with_context(|| format!("query iteration {id}"))?;
        raw.into_record()
    }

    /// The unfinished iteration of a run, if one was interrupted.
    pub fn open_iteration(&self, run_id: &str) -> Result<Option<IterationRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ITERATION_COLUMNS} FROM iterations
                     WHERE run_id = ?1 AND ended_at IS NULL ORDER BY number DESC LIMIT 1"
                ),
                [run_id],
                iteration_row,
            )
            .optional()
            .context("query open iteration")?;
        raw.map(RawIteration::into_record).transpose()
    }

    /// Last `limit` iterations of a run, oldest first.
    pub fn recent_iterations(&self, run_id: &str, limit: usize) -> Result<Vec<IterationRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ITERATION_COLUMNS} FROM iterations WHERE run_id = ?1
                 ORDER BY number DESC LIMIT ?2"
            ))
            .context("prepare recent iterations")?;
        let raws = stmt
            .query_map(params![run_id, limit as i64], iteration_row)
            .context("query iterations")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read iterations")?;
        let mut records = raws
            .into_iter()
            .map(RawIteration::into_record)
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    pub fn iteration_count(&self, run_id: &str) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM iterations WHERE run_id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .context("count iterations")
    }

    /// Record what orient saw and planned.
    pub fn set_iteration_plan(&self, id: i64, intent: &str, open_tasks: Option<u32>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE iterations SET intent = ?2, open_tasks = ?3 WHERE id = ?1",
                params![id, intent, open_tasks],
            )
            .with_context(|| format!("update iteration {id} plan"))?;
        Ok(())
    }

    pub fn set_failing_tests(&self, id: i64, failing: &BTreeSet<String>) -> Result<()> {
        let json = serde_json::to_string(failing).context("serialize failing tests")?;
        self.conn
            .execute(
                "UPDATE iterations SET failing_tests = ?2 WHERE id = ?1",
                params![id, json],
            )
            .with_context(|| format!("update iteration {id} failing tests"))?;
        Ok(())
    }

    pub fn finish_iteration(&self, id: i64, outcome: IterationOutcome) -> Result<()> {
        self.conn
            .execute(
                "UPDATE iterations SET outcome = ?2, ended_at = ?3 WHERE id = ?1",
                params![id, outcome.as_str(), now_rfc3339()],
            )
            .with_context(|| format!("finish iteration {id}"))?;
        debug!(id, outcome = outcome.as_str(), "iteration finished");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agent outputs
    // ------------------------------------------------------------------

    pub fn insert_agent_output(&self, record: &AgentOutputRecord) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO agent_outputs (iteration_id, role, task_id, transcript_path, summary, parsed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.iteration_id,
                    record.role,
                    record.task_id,
                    record.transcript_path,
                    record.summary,
                    record.parsed,
                    now_rfc3339(),
                ],
            )
            .context("insert agent output")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Validated orient output stored for an iteration, if any.
    pub fn stored_verdict(&self, iteration_id: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT parsed FROM agent_outputs WHERE iteration_id = ?1 AND role = 'orient'
                 ORDER BY id DESC LIMIT 1",
                [iteration_id],
                |row| row.get(0),
            )
            .optional()
            .context("query stored verdict")
    }

    /// Summaries of the last `limit` agent outputs in a run, oldest first.
    pub fn recent_summaries(&self, run_id: &str, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.role, a.task_id, a.summary FROM agent_outputs a
                 JOIN iterations i ON i.id = a.iteration_id
                 WHERE i.run_id = ?1 ORDER BY a.id DESC LIMIT ?2",
            )
            .context("prepare recent summaries")?;
        let mut out = stmt
            .query_map(params![run_id, limit as i64], |row| {
                let role: String = row.get(0)?;
                let task: Option<String> = row.get(1)?;
                let summary: String = row.get(2)?;
                Ok(match task {
                    Some(task) => format!("[{role} {task}] {summary}"),
                    None => format!("[{role}] {summary}"),
                })
            })
            .context("query recent summaries")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read recent summaries")?;
        out.reverse();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Human inputs
    // ------------------------------------------------------------------

    /// Queue an input. `run_id = None` targets whichever run reads it next.
    pub fn add_human_input(
        &self,
        run_id: Option<&str>,
        kind: HumanInputKind,
        content: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO human_inputs (run_id, kind, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, kind.as_str(), content, now_rfc3339()],
            )
            .context("insert human input")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Unconsumed inputs for `run_id` (or untargeted), oldest first.
    pub fn pending_inputs(&self, run_id: &str) -> Result<Vec<HumanInput>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, kind, content, created_at FROM human_inputs
                 WHERE consumed_at IS NULL AND (run_id IS NULL OR run_id = ?1)
                 ORDER BY id ASC",
            )
            .context("prepare pending inputs")?;
        let raws = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("query pending inputs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read pending inputs")?;
        raws.into_iter()
            .map(|(id, kind, content, created_at)| {
                Ok(HumanInput {
                    id,
                    kind: HumanInputKind::from_str(&kind)?,
                    content,
                    created_at,
                })
            })
            .collect()
    }

    pub fn consume_inputs(&self, ids: &[i64], iteration_number: u32) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction().context("begin consume inputs")?;
        let now = now_rfc3339();
        for id in ids {
            tx.execute(
                "UPDATE human_inputs SET consumed_at = ?2, consumed_in_iteration = ?3 WHERE id = ?1",
                params![id, now, iteration_number],
            )
            .with_context(|| format!("consume input {id}"))?;
        }
        tx.commit().context("commit consume inputs")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconcile marks and gaps
    // ------------------------------------------------------------------

    /// Applied instruction keys for an iteration, mapped to any created task id.
    pub fn applied_marks(&self, iteration_id: i64) -> Result<BTreeMap<String, Option<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, created_task_id FROM reconcile_marks WHERE iteration_id = ?1")
            .context("prepare reconcile marks")?;
        let rows = stmt
            .query_map([iteration_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("query reconcile marks")?
            .collect::<rusqlite::Result<Vec<(String, Option<String>)>>>()
            .context("read reconcile marks")?;
        Ok(rows.into_iter().collect())
    }

    pub fn mark_applied(
        &self,
        iteration_id: i64,
        key: &str,
        op: &str,
        created_task_id: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO reconcile_marks (iteration_id, key, op, created_task_id, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![iteration_id, key, op, created_task_id, now_rfc3339()],
            )
            .with_context(|| format!("record reconcile mark {key}"))?;
        Ok(())
    }

    pub fn record_gap(
        &self,
        iteration_id: i64,
        description: &str,
        severity: &str,
        task_id: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO gaps (iteration_id, description, severity, task_id) VALUES (?1, ?2, ?3, ?4)",
                params![iteration_id, description, severity, task_id],
            )
            .context("insert gap")?;
        Ok(())
    }

    pub fn gap_count(&self, iteration_id: i64) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM gaps WHERE iteration_id = ?1",
                [iteration_id],
                |row| row.get(0),
            )
            .context("count gaps")
    }

    // ------------------------------------------------------------------
    // Act checkpoints
    // ------------------------------------------------------------------

    pub fn checkpoint(&self, iteration_id: i64, checkpoint: &ActCheckpoint) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO act_checkpoints (iteration_id, task_id, state, detail, commit_sha, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    iteration_id,
                    checkpoint.task_id,
                    checkpoint.state,
                    checkpoint.detail,
                    checkpoint.commit_sha,
                    now_rfc3339(),
                ],
            )
            .context("insert act checkpoint")?;
        Ok(())
    }

    pub fn checkpoints(&self, iteration_id: i64) -> Result<Vec<ActCheckpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT task_id, state, detail, commit_sha FROM act_checkpoints
                 WHERE iteration_id = ?1 ORDER BY id ASC",
            )
            .context("prepare checkpoints")?;
        stmt.query_map([iteration_id], |row| {
            Ok(ActCheckpoint {
                task_id: row.get(0)?,
                state: row.get(1)?,
                detail: row.get(2)?,
                commit_sha: row.get(3)?,
            })
        })
        .context("query checkpoints")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read checkpoints")
    }

    /// Completed and blocked tasks across every iteration of a run.
    pub fn task_outcomes(&self, run_id: &str) -> Result<TaskOutcomes> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.task_id, c.state, c.detail FROM act_checkpoints c
                 JOIN iterations i ON i.id = c.iteration_id
                 WHERE i.run_id = ?1 AND c.task_id IS NOT NULL
                   AND c.state IN ('committed', 'completed', 'blocked')
                 ORDER BY c.id ASC",
            )
            .context("prepare task outcomes")?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("query task outcomes")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read task outcomes")?;
        let mut latest: BTreeMap<String, (String, String)> = BTreeMap::new();
        let mut order = Vec::new();
        for (task, state, detail) in rows {
            if !latest.contains_key(&task) {
                order.push(task.clone());
            }
            latest.insert(task, (state, detail));
        }
        let mut outcomes = TaskOutcomes::default();
        for task in order {
            let Some((state, detail)) = latest.remove(&task) else {
                continue;
            };
            if state == "blocked" {
                outcomes.blocked.push((task, detail));
            } else {
                outcomes.completed.push(task);
            }
        }
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Pending merges
    // ------------------------------------------------------------------

    pub fn add_pending_merge(&self, run_id: &str, merge: &PendingMerge) -> Result<i64> {
        let conflicts = serde_json::to_string(&merge.conflicts).context("serialize conflicts")?;
        self.conn
            .execute(
                "INSERT INTO pending_merges (run_id, branch, iteration_number, reason, conflicts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    merge.branch,
                    merge.iteration,
                    merge.reason,
                    conflicts,
                    now_rfc3339(),
                ],
            )
            .context("insert pending merge")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn pending_merges(&self, run_id: &str) -> Result<Vec<StoredPendingMerge>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, branch, iteration_number, reason, conflicts FROM pending_merges
                 WHERE run_id = ?1 AND resolved_at IS NULL ORDER BY id ASC",
            )
            .context("prepare pending merges")?;
        let raws = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("query pending merges")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read pending merges")?;
        raws.into_iter()
            .map(|(id, branch, iteration, reason, conflicts)| {
                let conflicts: Vec<String> = serde_json::from_str(&conflicts)
                    .with_context(|| format!("parse conflicts of pending merge {id}"))?;
                Ok(StoredPendingMerge {
                    id,
                    merge: PendingMerge {
                        branch,
                        iteration,
                        reason,
                        conflicts,
                    },
                })
            })
            .collect()
    }

    pub fn resolve_pending_merge(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pending_merges SET resolved_at = ?2 WHERE id = ?1",
                params![id, now_rfc3339()],
            )
            .with_context(|| format!("resolve pending merge {id}"))?;
        Ok(())
    }
}

const RUN_COLUMNS: &str = "id, spec_path, spec_content, status, started_at, ended_at, root_task_id, milestone_branch, base_commit, stop_reason";

struct RawRun {
    id: String,
    spec_path: String,
    spec_content: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    root_task_id: Option<String>,
    milestone_branch: Option<String>,
    base_commit: Option<String>,
    stop_reason: Option<String>,
}

fn run_row(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        spec_path: row.get(1)?,
        spec_content: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        root_task_id: row.get(6)?,
        milestone_branch: row.get(7)?,
        base_commit: row.get(8)?,
        stop_reason: row.get(9)?,
    })
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            status: RunStatus::from_str(&self.status)
                .with_context(|| format!("run {}", self.id))?,
            id: self.id,
            spec_path: self.spec_path,
            spec_content: self.spec_content,
            started_at: self.started_at,
            ended_at: self.ended_at,
            root_task_id: self.root_task_id,
            milestone_branch: self.milestone_branch,
            base_commit: self.base_commit,
            stop_reason: self.stop_reason,
        })
    }
}

const ITERATION_COLUMNS: &str =
    "id, run_id, number, intent, outcome, started_at, ended_at, open_tasks, failing_tests";

struct RawIteration {
    id: i64,
    run_id: String,
    number: u32,
    intent: String,
    outcome: String,
    started_at: String,
    ended_at: Option<String>,
    open_tasks: Option<u32>,
    failing_tests: String,
}

fn iteration_row(row: &Row<'_>) -> rusqlite::Result<RawIteration> {
    Ok(RawIteration {
        id: row.get(0)?,
        run_id: row.get(1)?,
        number: row.get(2)?,
        intent: row.get(3)?,
        outcome: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        open_tasks: row.get(7)?,
        failing_tests: row.get(8)?,
    })
}

impl RawIteration {
    fn into_record(self) -> Result<IterationRecord> {
        Ok(IterationRecord {
            outcome: IterationOutcome::from_str(&self.outcome)
                .with_context(|| format!("iteration {}", self.id))?,
            failing_tests: serde_json::from_str(&self.failing_tests)
                .with_context(|| format!("parse failing tests of iteration {}", self.id))?,
            id: self.id,
            run_id: self.run_id,
            number: self.number,
            intent: self.intent,
            started_at: self.started_at,
            ended_at: self.ended_at,
            open_tasks: self.open_tasks,
        })
    }
}
