//! Failure taxonomy for the control plane.
//!
//! Errors travel as `anyhow::Error`; callers that need to react to a class
//! recover it with `err.downcast_ref::<T>()`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One violation in structured output, keyed by JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub error: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            error: error.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltKind {
    SchemaViolation,
    ReferentialIntegrity,
    MalformedOutput,
    Permission,
    InvalidState,
}

impl HaltKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaViolation => "schema violation",
            Self::ReferentialIntegrity => "referential integrity",
            Self::MalformedOutput => "malformed output",
            Self::Permission => "permission",
            Self::InvalidState => "invalid state",
        }
    }
}

/// A failure that may succeed if retried (timeouts, rate limits, 5xx).
#[derive(Debug, Clone, Error)]
#[error("{operation}: transient failure: {message}")]
pub struct TransientError {
    pub operation: String,
    pub message: String,
}

/// A failure that halts the run. Never retried.
#[derive(Debug, Clone, Error)]
#[error("{} in {detail}{}", .kind.as_str(), render_fields(.fields))]
pub struct StructuralHalt {
    pub kind: HaltKind,
    pub detail: String,
    pub fields: Vec<FieldError>,
}

impl StructuralHalt {
    pub fn new(kind: HaltKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_fields(kind: HaltKind, detail: impl Into<String>, fields: Vec<FieldError>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            fields,
        }
    }
}

fn render_fields(fields: &[FieldError]) -> String {
    if fields.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = fields.iter().map(ToString::to_string).collect();
    format!(":\n- {}", lines.join("\n- "))
}

/// Transient failures persisted past the retry budget.
#[derive(Debug, Clone, Error)]
#[error("{operation}: gave up after {attempts} attempts: {last}")]
pub struct RetriesExhausted {
    pub operation: String,
    pub attempts: u32,
    pub last: String,
}

/// Cooperative cancellation observed at an external-call boundary.
#[derive(Debug, Clone, Copy, Error)]
#[error("interrupted")]
pub struct Interrupted;
