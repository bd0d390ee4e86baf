//! Audit files for every agent invocation.
//!
//! Layout: `.ooda/transcripts/<run>/<iteration>/<role>[-<task>].{prompt.md,output.json,log}`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
    pub log_path: PathBuf,
}

impl TranscriptPaths {
    /// Paths for one invocation. `attempt` > 1 gets its own suffix so fix
    /// attempts never overwrite the first transcript.
    pub fn new(
        transcripts_dir: &Path,
        run_id: &str,
        iteration: u32,
        role: &str,
        task_id: Option<&str>,
        attempt: u32,
    ) -> Self {
        let dir = transcripts_dir.join(run_id).join(iteration.to_string());
        let mut stem = match task_id {
            Some(task) => format!("{role}-{}", sanitize(task)),
            None => role.to_string(),
        };
        if attempt > 1 {
            stem.push_str(&format!("-{attempt}"));
        }
        Self {
            prompt_path: dir.join(format!("{stem}.prompt.md")),
            output_path: dir.join(format!("{stem}.output.json")),
            log_path: dir.join(format!("{stem}.log")),
            dir,
        }
    }

    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create transcript dir {}", self.dir.display()))
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        self.prepare()?;
        fs::write(&self.prompt_path, prompt)
            .with_context(|| format!("write prompt {}", self.prompt_path.display()))
    }

    /// Remove a stale output left by an interrupted attempt.
    pub fn clear_output(&self) -> Result<()> {
        if self.output_path.exists() {
            fs::remove_file(&self.output_path)
                .with_context(|| format!("remove stale output {}", self.output_path.display()))?;
        }
        Ok(())
    }
}

fn sanitize(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
