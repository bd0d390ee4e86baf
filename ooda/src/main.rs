//! `ooda`: drive a spec file to completion with a SENSE → ORIENT → DECIDE → ACT loop.
//!
//! All state lives under `.ooda/` in the current git repository.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use ooda::core::types::HumanInputKind;
use ooda::error::Interrupted;
use ooda::exit_codes;
use ooda::io::agent::CommandAgent;
use ooda::io::config::{OodaConfig, load_config, write_config};
use ooda::io::git::Git;
use ooda::io::paths::{OodaPaths, ensure_layout};
use ooda::io::signal::{CancelFlag, install_ctrlc};
use ooda::io::store::{RunRecord, Store};
use ooda::io::test_runner::CommandTestRunner;
use ooda::io::tracker::CliTracker;
use ooda::logging;
use ooda::looping::{Engine, IterationReport, LoopOutcome, LoopStop, run_loop};
use ooda::orient::AgentReasoner;
use ooda::report::{render_history, render_status};
use ooda::start::{StartContext, resume_run, start_run};

#[derive(Parser)]
#[command(
    name = "ooda",
    version,
    about = "Bounded, resumable SENSE/ORIENT/DECIDE/ACT loop toward a spec file"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run and loop until DONE, STUCK, or the iteration limit.
    Run {
        /// Spec file (defaults to `spec_path` in `.ooda/config.toml`).
        #[arg(long)]
        spec: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show the latest run and its recent iterations.
    Status,
    /// List recent runs.
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Continue an unfinished run.
    Resume {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Queue guidance or a control signal for the next ORIENT.
    Input {
        message: Option<String>,
        #[arg(long, value_enum, default_value_t = InputKind::Comment)]
        kind: InputKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InputKind {
    Comment,
    Pause,
    Resume,
    Abort,
}

impl From<InputKind> for HumanInputKind {
    fn from(kind: InputKind) -> Self {
        match kind {
            InputKind::Comment => Self::Comment,
            InputKind::Pause => Self::Pause,
            InputKind::Resume => Self::Resume,
            InputKind::Abort => Self::Abort,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<Interrupted>().is_some() {
                exit_codes::INTERRUPTED
            } else {
                exit_codes::HALT
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Run {
            spec,
            max_iterations,
        } => cmd_run(&root, spec.as_deref(), max_iterations),
        Command::Status => cmd_report(&root, render_status),
        Command::History { limit } => cmd_report(&root, |store| render_history(store, limit)),
        Command::Resume {
            run_id,
            max_iterations,
        } => cmd_resume(&root, run_id.as_deref(), max_iterations),
        Command::Input { message, kind } => cmd_input(&root, message.as_deref(), kind.into()),
    }
}

/// Layout, config, and store for commands that mutate state.
fn open_workspace(root: &Path) -> Result<(OodaPaths, OodaConfig, Store)> {
    if !Git::new(root).is_repo()? {
        bail!("{} is not a git repository", root.display());
    }
    let paths = ensure_layout(root)?;
    let config = load_config(&paths.config_path)?;
    if !paths.config_path.exists() {
        write_config(&paths.config_path, &config)?;
        debug!(path = %paths.config_path.display(), "wrote default config");
    }
    let store = Store::open(&paths.db_path)?;
    Ok((paths, config, store))
}

fn cmd_run(root: &Path, spec: Option<&Path>, max_iterations: Option<u32>) -> Result<i32> {
    let (paths, mut config, store) = open_workspace(root)?;
    if let Some(limit) = max_iterations {
        config.max_iterations = limit;
    }
    let cancel = CancelFlag::new();
    install_ctrlc(&cancel)?;
    let git = Git::new(root);
    let tracker = tracker_for(&config, root);
    let run = start_run(
        &StartContext {
            paths: &paths,
            config: &config,
            git: &git,
            tracker: &tracker,
            store: &store,
            cancel: &cancel,
        },
        spec,
    )?;
    println!(
        "Started run {} on {}",
        run.id,
        run.milestone_branch.as_deref().unwrap_or("-")
    );
    drive(&paths, &config, &store, &git, &tracker, &cancel, &run)
}

fn cmd_resume(root: &Path, run_id: Option<&str>, max_iterations: Option<u32>) -> Result<i32> {
    let (paths, mut config, store) = open_workspace(root)?;
    if let Some(limit) = max_iterations {
        config.max_iterations = limit;
    }
    let cancel = CancelFlag::new();
    install_ctrlc(&cancel)?;
    let git = Git::new(root);
    let tracker = tracker_for(&config, root);
    let run = resume_run(&store, &git, run_id)?;
    println!("Resuming run {}", run.id);
    drive(&paths, &config, &store, &git, &tracker, &cancel, &run)
}

fn tracker_for(config: &OodaConfig, root: &Path) -> CliTracker {
    CliTracker::new(
        config.tracker.command.clone(),
        root,
        Duration::from_secs(config.tracker.timeout_secs),
    )
}

fn drive(
    paths: &OodaPaths,
    config: &OodaConfig,
    store: &Store,
    git: &Git,
    tracker: &CliTracker,
    cancel: &CancelFlag,
    run: &RunRecord,
) -> Result<i32> {
    let agent = CommandAgent::new(config.agent.command.clone());
    let tests = CommandTestRunner::new(
        config.tests.command.clone(),
        &paths.root,
        Duration::from_secs(config.tests.timeout_secs),
    );
    let reasoner = AgentReasoner::new(
        &agent,
        &config.agent,
        &paths.transcripts_dir,
        &paths.schemas_dir,
        config.retry.policy(),
        cancel,
    );
    let engine = Engine {
        paths,
        config,
        store,
        git,
        reasoner: &reasoner,
        agent: &agent,
        tracker,
        tests: &tests,
        cancel,
    };
    let outcome = run_loop(&engine, &run.id, config.max_iterations, print_iteration)?;
    debug!(executed = outcome.iterations_executed, "loop finished");
    Ok(report_outcome(paths, &outcome))
}

fn print_iteration(report: &IterationReport) {
    let tasks = report.act.as_ref().map_or(0, |act| act.tasks.len());
    println!(
        "iteration {}: {} ({} task(s) acted) {}",
        report.number,
        report.decision.outcome.as_str(),
        tasks,
        report.intent
    );
}

fn report_outcome(paths: &OodaPaths, outcome: &LoopOutcome) -> i32 {
    let summary = paths.summary_path(&outcome.run_id);
    match &outcome.stop {
        LoopStop::Done { summary: text } => {
            println!("DONE: {text}");
            println!("Summary: {}", summary.display());
            exit_codes::OK
        }
        LoopStop::Stuck { reason } => {
            println!("STUCK: {reason}");
            println!("Summary: {}", summary.display());
            exit_codes::OK
        }
        LoopStop::Paused => {
            println!("Paused. Continue with `ooda resume`.");
            exit_codes::OK
        }
        LoopStop::Aborted { reason } => {
            println!("ABORTED: {reason}");
            exit_codes::OK
        }
        LoopStop::MaxIterations { max_iterations } => {
            println!("Reached max iterations ({max_iterations}). Continue with `ooda resume`.");
            exit_codes::MAX_ITERATIONS
        }
        LoopStop::Interrupted => {
            eprintln!("Interrupted. Continue with `ooda resume`.");
            exit_codes::INTERRUPTED
        }
    }
}

fn cmd_report(root: &Path, render: impl FnOnce(&Store) -> Result<String>) -> Result<i32> {
    let paths = OodaPaths::new(root);
    if !paths.db_path.exists() {
        println!("No runs recorded.");
        return Ok(exit_codes::OK);
    }
    let store = Store::open(&paths.db_path)?;
    print!("{}", render(&store)?);
    Ok(exit_codes::OK)
}

fn cmd_input(root: &Path, message: Option<&str>, kind: HumanInputKind) -> Result<i32> {
    let message = message.map(str::trim).unwrap_or("");
    if kind == HumanInputKind::Comment && message.is_empty() {
        bail!("a comment needs a message");
    }
    let (_, _, store) = open_workspace(root)?;
    let target = store.latest_running_run()?.map(|run| run.id);
    let id = store.add_human_input(target.as_deref(), kind, message)?;
    match target {
        Some(run_id) => println!("Queued {} #{id} for run {run_id}", kind.as_str()),
        None => println!("Queued {} #{id} for the next run", kind.as_str()),
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from(["ooda", "run", "--spec", "docs/SPEC.md", "--max-iterations", "3"]);
        let Command::Run {
            spec,
            max_iterations,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(spec, Some(PathBuf::from("docs/SPEC.md")));
        assert_eq!(max_iterations, Some(3));
    }

    #[test]
    fn parse_input_kind() {
        let cli = Cli::parse_from(["ooda", "input", "--kind", "pause"]);
        assert!(matches!(
            cli.command,
            Command::Input {
                message: None,
                kind: InputKind::Pause
            }
        ));
        let cli = Cli::parse_from(["ooda", "input", "use sqlite"]);
        let Command::Input { message, kind } = cli.command else {
            panic!("expected input");
        };
        assert_eq!(message.as_deref(), Some("use sqlite"));
        assert_eq!(kind, InputKind::Comment);
    }

    #[test]
    fn parse_history_limit() {
        let cli = Cli::parse_from(["ooda", "history", "-n", "3"]);
        assert!(matches!(cli.command, Command::History { limit: 3 }));
    }
}
