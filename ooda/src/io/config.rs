//! Engine configuration stored under `.ooda/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::loop_detect::{DEFAULT_THRESHOLD, DEFAULT_WINDOW, LoopDetector};
use crate::core::retry::RetryPolicy;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to
/// defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OodaConfig {
    /// Upper bound on iterations per `run`/`resume` invocation.
    pub max_iterations: u32,
    /// Prefix for milestone and iteration branches.
    pub branch_prefix: String,
    /// Spec file, relative to the repository root.
    pub spec_path: String,
    pub agent: AgentConfig,
    pub tracker: TrackerConfig,
    pub tests: TestsConfig,
    pub retry: RetryConfig,
    pub loop_detection: LoopDetectionConfig,
    pub act: ActConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Argv for the reasoning CLI. `{schema}`, `{output}` and `{workdir}` are
    /// substituted; the prompt is written to stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Rendered prompts larger than this drop optional sections.
    pub prompt_budget_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--sandbox",
                "danger-full-access",
                "--skip-git-repo-check",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Argv prefix for the work tracker CLI.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: vec!["trc".to_string()],
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Test command argv. Empty means the repository has no tests to run.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopDetectionConfig {
    /// Number of trailing iterations inspected.
    pub window: usize,
    /// Consecutive repetitions that count as stagnation.
    pub threshold: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl LoopDetectionConfig {
    pub fn detector(&self) -> LoopDetector {
        LoopDetector::new(self.window, self.threshold)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActConfig {
    /// Extra agent invocations allowed to fix new test failures.
    pub fix_attempts: u32,
}

impl Default for ActConfig {
    fn default() -> Self {
        Self { fix_attempts: 1 }
    }
}

impl Default for OodaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            branch_prefix: "ooda".to_string(),
            spec_path: "SPEC.md".to_string(),
            agent: AgentConfig::default(),
            tracker: TrackerConfig::default(),
            tests: TestsConfig {
                command: Vec::new(),
                timeout_secs: 10 * 60,
            },
            retry: RetryConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            act: ActConfig::default(),
        }
    }
}

impl OodaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.branch_prefix.trim().is_empty() || self.branch_prefix.contains(' ') {
            return Err(anyhow!("branch_prefix must be a non-empty ref component"));
        }
        if self.spec_path.trim().is_empty() {
            return Err(anyhow!("spec_path must not be empty"));
        }
        if self.agent.command.first().is_none_or(|bin| bin.trim().is_empty()) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.agent.prompt_budget_bytes < 1_000 {
            return Err(anyhow!("agent.prompt_budget_bytes must be >= 1000"));
        }
        if self.tracker.command.first().is_none_or(|bin| bin.trim().is_empty()) {
            return Err(anyhow!("tracker.command must be a non-empty array"));
        }
        if self.tracker.timeout_secs == 0 {
            return Err(anyhow!("tracker.timeout_secs must be > 0"));
        }
        if !self.tests.command.is_empty() && self.tests.timeout_secs == 0 {
            return Err(anyhow!("tests.timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(anyhow!("retry.jitter must be within 0.0..=1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        if self.loop_detection.threshold < 2 {
            return Err(anyhow!("loop_detection.threshold must be >= 2"));
        }
        if self.loop_detection.window < self.loop_detection.threshold {
            return Err(anyhow!("loop_detection.window must be >= threshold"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OodaConfig::default()`.
pub fn load_config(path: &Path) -> Result<OodaConfig> {
    if !path.exists() {
        let cfg = OodaConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OodaConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OodaConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OodaConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OodaConfig {
            max_iterations: 7,
            tests: TestsConfig {
                command: vec!["cargo".to_string(), "test".to_string()],
                timeout_secs: 120,
            },
            ..OodaConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join(".config.toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 4\n[loop_detection]\nthreshold = 3\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 4);
        assert_eq!(cfg.loop_detection.threshold, 3);
        assert_eq!(cfg.loop_detection.window, DEFAULT_WINDOW);
        assert_eq!(cfg.retry, RetryConfig::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = OodaConfig::default();
        cfg.retry.jitter = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = OodaConfig::default();
        cfg.loop_detection.threshold = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = OodaConfig::default();
        cfg.tracker.command.clear();
        assert!(cfg.validate().is_err());
    }
}
