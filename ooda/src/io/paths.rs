//! Canonical locations under `.ooda/` and idempotent scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use uuid::Uuid;

/// Ignore everything in the state directory, the ignore file included.
const OODA_GITIGNORE: &str = "*\n";

/// All canonical paths within `.ooda/` for a project root.
#[derive(Debug, Clone)]
pub struct OodaPaths {
    pub root: PathBuf,
    pub ooda_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub project_id_path: PathBuf,
    pub learnings_log_path: PathBuf,
    pub learnings_md_path: PathBuf,
    pub transcripts_dir: PathBuf,
    pub summaries_dir: PathBuf,
    /// Output schemas handed to the agent CLI.
    pub schemas_dir: PathBuf,
}

impl OodaPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ooda_dir = root.join(".ooda");
        Self {
            root: root.clone(),
            gitignore_path: ooda_dir.join(".gitignore"),
            db_path: ooda_dir.join("ooda.db"),
            config_path: ooda_dir.join("config.toml"),
            project_id_path: ooda_dir.join("project-id"),
            learnings_log_path: ooda_dir.join("learnings.jsonl"),
            learnings_md_path: ooda_dir.join("learnings.md"),
            transcripts_dir: ooda_dir.join("transcripts"),
            summaries_dir: ooda_dir.join("summaries"),
            schemas_dir: ooda_dir.join("schemas"),
            ooda_dir,
        }
    }

    pub fn summary_path(&self, run_id: &str) -> PathBuf {
        self.summaries_dir.join(format!("{run_id}.md"))
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Create `.ooda/` scaffolding in `root` if missing. Safe to call repeatedly.
pub fn ensure_layout(root: &Path) -> Result<OodaPaths> {
    let paths = OodaPaths::new(root);
    for dir in [
        &paths.ooda_dir,
        &paths.transcripts_dir,
        &paths.summaries_dir,
        &paths.schemas_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    let current = fs::read_to_string(&paths.gitignore_path).unwrap_or_default();
    if current != OODA_GITIGNORE {
        fs::write(&paths.gitignore_path, OODA_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    if !paths.project_id_path.exists() {
        let id = Uuid::new_v4().to_string();
        debug!(project_id = %id, "created project id");
        fs::write(&paths.project_id_path, format!("{id}\n"))
            .with_context(|| format!("write {}", paths.project_id_path.display()))?;
    }
    Ok(paths)
}

pub fn read_project_id(paths: &OodaPaths) -> Result<String> {
    let raw = fs::read_to_string(&paths.project_id_path)
        .with_context(|| format!("read {}", paths.project_id_path.display()))?;
    Ok(raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_layout_creates_directories_and_keeps_project_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ensure_layout(temp.path()).expect("layout");
        assert!(paths.transcripts_dir.is_dir());
        assert!(paths.summaries_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            OODA_GITIGNORE
        );
        let id = read_project_id(&paths).expect("id");
        assert_eq!(id.len(), 36);

        ensure_layout(temp.path()).expect("again");
        assert_eq!(read_project_id(&paths).expect("id"), id);
    }
}
