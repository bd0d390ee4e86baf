//! Persistence for the learnings event log and its rendered markdown view.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::learnings::{LearningEvent, LearningsLog, Validity};
use crate::io::config::write_atomic;

/// Load every event from `learnings.jsonl`. A missing file is an empty log.
pub fn load_learnings(path: &Path) -> Result<LearningsLog> {
    if !path.exists() {
        return Ok(LearningsLog::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut events = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: LearningEvent = serde_json::from_str(line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        events.push(event);
    }
    Ok(LearningsLog::from_events(events))
}

/// Append events to the log, one JSON object per line.
pub fn append_events(path: &Path, events: &[LearningEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = String::new();
    for event in events {
        buf.push_str(&serde_json::to_string(event).context("serialize learning event")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    debug!(count = events.len(), "learning events appended");
    Ok(())
}

/// Render the current view as markdown.
pub fn render_learnings(log: &LearningsLog) -> String {
    let entries = log.entries();
    let mut out = String::from("# Learnings\n");
    let valid: Vec<_> = entries
        .iter()
        .filter(|e| e.validity == Validity::Valid)
        .collect();
    let deprecated: Vec<_> = entries
        .iter()
        .filter(|e| e.validity == Validity::Deprecated)
        .collect();

    out.push_str("\n## Valid\n\n");
    if valid.is_empty() {
        out.push_str("_None yet._\n");
    }
    for entry in valid {
        out.push_str(&format!(
            "- **{}** (iteration {}): {}\n",
            entry.id, entry.added_in, entry.text
        ));
    }
    if !deprecated.is_empty() {
        out.push_str("\n## Deprecated\n\n");
        for entry in deprecated {
            out.push_str(&format!(
                "- ~~{}~~ **{}**: {}\n",
                entry.text,
                entry.id,
                entry.deprecation_reason.as_deref().unwrap_or("deprecated")
            ));
        }
    }
    out
}

/// Append `events` and atomically rewrite `learnings.md` from `log`.
pub fn persist_learnings(
    log_path: &Path,
    md_path: &Path,
    log: &LearningsLog,
    events: &[LearningEvent],
) -> Result<()> {
    append_events(log_path, events)?;
    write_atomic(md_path, &render_learnings(log))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_survive_a_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("learnings.jsonl");
        let md_path = temp.path().join("learnings.md");

        let mut log = load_learnings(&log_path).expect("empty");
        let mut events = Vec::new();
        events.extend(log.add("Run `cargo test -p api` for fast checks", 1, "orient"));
        events.extend(log.add("Config lives in src/config.rs", 1, "act"));
        events.extend(log.deprecate("L1", "api crate was removed", 2));
        persist_learnings(&log_path, &md_path, &log, &events).expect("persist");

        let reloaded = load_learnings(&log_path).expect("reload");
        assert_eq!(reloaded, log);
        assert_eq!(reloaded.valid().len(), 1);

        let md = fs::read_to_string(&md_path).expect("md");
        assert!(md.contains("## Valid"));
        assert!(md.contains("**L2** (iteration 1)"));
        assert!(md.contains("api crate was removed"));
    }

    #[test]
    fn render_handles_empty_log() {
        let md = render_learnings(&LearningsLog::new());
        assert!(md.contains("_None yet._"));
        assert!(!md.contains("## Deprecated"));
    }
}
