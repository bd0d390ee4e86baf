//! Append-and-deprecate log of efficiency learnings.
//!
//! Learnings are never edited or removed. Invalidation appends a
//! `Deprecated` event, so the full history stays auditable and the current
//! view is a fold over the events.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LearningEvent {
    Added {
        seq: u64,
        id: String,
        text: String,
        iteration: u32,
        source: String,
    },
    Deprecated {
        seq: u64,
        id: String,
        reason: String,
        iteration: u32,
    },
}

impl LearningEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Added { seq, .. } | Self::Deprecated { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Valid,
    Deprecated,
}

/// Current view of one learning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Learning {
    pub id: String,
    pub text: String,
    pub validity: Validity,
    pub added_in: u32,
    pub deprecation_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearningsLog {
    events: Vec<LearningEvent>,
}

impl LearningsLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted events, ordered by sequence number.
    pub fn from_events(mut events: Vec<LearningEvent>) -> Self {
        events.sort_by_key(LearningEvent::seq);
        Self { events }
    }

    pub fn events(&self) -> &[LearningEvent] {
        &self.events
    }

    fn next_seq(&self) -> u64 {
        self.events.last().map_or(1, |event| event.seq() + 1)
    }

    fn next_id(&self) -> String {
        let added = self
            .events
            .iter()
            .filter(|event| matches!(event, LearningEvent::Added { .. }))
            .count();
        format!("L{}", added + 1)
    }

    /// Current state of every learning, in insertion order.
    pub fn entries(&self) -> Vec<Learning> {
        let mut order = Vec::new();
        let mut by_id: BTreeMap<String, Learning> = BTreeMap::new();
        for event in &self.events {
            match event {
                LearningEvent::Added {
                    id,
                    text,
                    iteration,
                    ..
                } => {
                    order.push(id.clone());
                    by_id.insert(
                        id.clone(),
                        Learning {
                            id: id.clone(),
                            text: text.clone(),
                            validity: Validity::Valid,
                            added_in: *iteration,
                            deprecation_reason: None,
                        },
                    );
                }
                LearningEvent::Deprecated { id, reason, .. } => {
                    if let Some(entry) = by_id.get_mut(id) {
                        entry.validity = Validity::Deprecated;
                        entry.deprecation_reason = Some(reason.clone());
                    }
                }
            }
        }
        order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect()
    }

    pub fn valid(&self) -> Vec<Learning> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.validity == Validity::Valid)
            .collect()
    }

    /// Append a learning unless an identical valid one already exists.
    ///
    /// Returns the new event, or `None` for a duplicate or blank text.
    pub fn add(&mut self, text: &str, iteration: u32, source: &str) -> Option<LearningEvent> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let key = normalize(text);
        if self.valid().iter().any(|entry| normalize(&entry.text) == key) {
            return None;
        }
        let event = LearningEvent::Added {
            seq: self.next_seq(),
            id: self.next_id(),
            text: text.to_string(),
            iteration,
            source: source.to_string(),
        };
        self.events.push(event.clone());
        Some(event)
    }

    /// Mark a valid learning deprecated. Unknown or already deprecated ids are ignored.
    pub fn deprecate(&mut self, id: &str, reason: &str, iteration: u32) -> Option<LearningEvent> {
        if !self.valid().iter().any(|entry| entry.id == id) {
            return None;
        }
        let event = LearningEvent::Deprecated {
            seq: self.next_seq(),
            id: id.to_string(),
            reason: reason.trim().to_string(),
            iteration,
        };
        self.events.push(event.clone());
        Some(event)
    }
}

static BACKTICK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\s]+)`").expect("backtick regex"));
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(])((?:\./)?[A-Za-z0-9_.-]+(?:/[A-Za-z0-9_.-]+)+/?)")
        .expect("path regex")
});

/// Filesystem paths a learning refers to: backticked tokens and slash-separated words.
pub fn referenced_paths(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in BACKTICK_RE.captures_iter(text) {
        let token = caps[1].trim_end_matches(['.', ',', ':', ';']);
        if looks_like_path(token) {
            out.push(clean_path(token));
        }
    }
    for caps in PATH_RE.captures_iter(text) {
        let token = caps[1].trim_end_matches(['.', ',', ':', ';']);
        if token.contains("://") {
            continue;
        }
        out.push(clean_path(token));
    }
    out.sort();
    out.dedup();
    out
}

fn looks_like_path(token: &str) -> bool {
    token.contains('/')
        || token
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && (1..=5).contains(&ext.len()))
}

fn clean_path(token: &str) -> String {
    let token = token.strip_prefix("./").unwrap_or(token);
    let token = token.trim_end_matches('/');
    token.to_string()
}

/// Learnings contradicted by path claims, as `(id, reason)` pairs.
///
/// A learning is contradicted when any path it references is reported missing.
pub fn contradicted_by_paths(
    log: &LearningsLog,
    path_checks: &BTreeMap<String, bool>,
) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for entry in log.valid() {
        let missing: Vec<String> = referenced_paths(&entry.text)
            .into_iter()
            .filter(|path| path_checks.get(path) == Some(&false))
            .collect();
        if missing.is_empty() {
            continue;
        }
        out.push((
            entry.id.clone(),
            format!("referenced path(s) no longer exist: {}", missing.join(", ")),
        ));
    }
    out
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_ids_and_skips_duplicates() {
        let mut log = LearningsLog::new();
        assert!(log.add("Run `cargo test -q` for speed", 1, "orient").is_some());
        assert!(log.add("run `cargo test -q`   for speed", 2, "act").is_none());
        assert!(log.add("  ", 2, "act").is_none());
        let added = log.add("Fixtures live in tests/fixtures", 2, "act").expect("add");
        assert!(matches!(added, LearningEvent::Added { ref id, .. } if id == "L2"));
        assert_eq!(log.valid().len(), 2);
    }

    #[test]
    fn deprecate_keeps_history() {
        let mut log = LearningsLog::new();
        log.add("Config lives in config/app.toml", 1, "orient");
        assert!(log.deprecate("L1", "moved", 2).is_some());
        assert!(log.deprecate("L1", "again", 3).is_none());

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].validity, Validity::Deprecated);
        assert_eq!(entries[0].deprecation_reason.as_deref(), Some("moved"));
        assert!(log.valid().is_empty());
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn referenced_paths_extracts_backticks_and_slashes() {
        let paths = referenced_paths("Tests live in `tests/unit/` and ./src/lib.rs, see https://x.io/a");
        assert_eq!(paths, vec!["src/lib.rs".to_string(), "tests/unit".to_string()]);
        assert_eq!(referenced_paths("Use `Cargo.toml` features"), vec!["Cargo.toml"]);
        assert!(referenced_paths("prefer small commits").is_empty());
    }

    /// A learning naming path A is deprecated once claims say A is gone and B exists.
    #[test]
    fn learning_is_deprecated_when_path_claims_contradict_it() {
        let mut log = LearningsLog::new();
        log.add("Tests live in tests/unit", 1, "orient");
        log.add("Prefer small commits", 1, "orient");

        let mut checks = BTreeMap::new();
        checks.insert("tests/unit".to_string(), false);
        checks.insert("tests/integration".to_string(), true);

        let contradicted = contradicted_by_paths(&log, &checks);
        assert_eq!(contradicted.len(), 1);
        assert_eq!(contradicted[0].0, "L1");

        for (id, reason) in contradicted {
            log.deprecate(&id, &reason, 2);
        }
        let valid: Vec<String> = log.valid().into_iter().map(|l| l.text).collect();
        assert_eq!(valid, vec!["Prefer small commits".to_string()]);
    }

    #[test]
    fn from_events_orders_by_sequence() {
        let mut log = LearningsLog::new();
        let first = log.add("a/b exists", 1, "orient").expect("add");
        let second = log.deprecate("L1", "gone", 2).expect("deprecate");
        let rebuilt = LearningsLog::from_events(vec![second, first]);
        assert_eq!(rebuilt.entries(), log.entries());
    }
}
