//! Agent abstraction for reasoning and act invocations.
//!
//! The [`Agent`] trait decouples orchestration from the agent backend. The
//! production backend spawns a configurable CLI (`codex exec` by default);
//! tests use scripted agents that write predetermined outputs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Orient,
    Act,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orient => "orient",
            Self::Act => "act",
        }
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    /// Task being worked on, for act invocations.
    pub task_id: Option<String>,
    pub workdir: PathBuf,
    pub prompt: String,
    /// JSON Schema that constrains the agent's final message.
    pub schema_path: PathBuf,
    /// Where the agent must leave its raw output.
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Agent {
    /// Run the agent. Must leave output at `request.output_path`.
    fn invoke(&self, request: &AgentRequest) -> Result<()>;
}

/// Agent that spawns the configured argv and feeds the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn argv(&self, request: &AgentRequest) -> Vec<String> {
        let schema = request.schema_path.display().to_string();
        let output = request.output_path.display().to_string();
        let workdir = request.workdir.display().to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{schema}", &schema)
                    .replace("{output}", &output)
                    .replace("{workdir}", &workdir)
            })
            .collect()
    }

    fn writes_output_itself(&self) -> bool {
        self.command.iter().any(|arg| arg.contains("{output}"))
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(role = request.role.as_str(), timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        let argv = self.argv(request);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent {program}"))?;

        write_log(
            &request.log_path,
            &output.render_log("agent", request.output_limit_bytes),
        )?;

        if !output.success() {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "agent failed");
            return Err(anyhow!(output.failure_message("agent", request.timeout)));
        }
        if !self.writes_output_itself() {
            fs::write(&request.output_path, &output.stdout).with_context(|| {
                format!("write agent output {}", request.output_path.display())
            })?;
        }
        debug!("agent completed successfully");
        Ok(())
    }
}

/// Invoke the agent and return its raw output text.
#[instrument(skip_all, fields(role = request.role.as_str(), output_path = %request.output_path.display()))]
pub fn invoke_and_read<A: Agent + ?Sized>(agent: &A, request: &AgentRequest) -> Result<String> {
    agent.invoke(request)?;
    if !request.output_path.exists() {
        return Err(anyhow!(
            "missing agent output {}",
            request.output_path.display()
        ));
    }
    fs::read_to_string(&request.output_path)
        .with_context(|| format!("read agent output {}", request.output_path.display()))
}

/// Write an embedded schema where the agent CLI can read it.
pub fn write_schema(path: &Path, contents: &str) -> Result<()> {
    if fs::read_to_string(path).is_ok_and(|current| current == contents) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write schema {}", path.display()))
}

fn write_log(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    fs::write(path, body).with_context(|| format!("write agent log {}", path.display()))
}
