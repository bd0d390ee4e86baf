//! Bounded, resumable OODA loop that drives a repository toward a spec file.
//!
//! Each iteration runs SENSE → ORIENT → DECIDE → ACT:
//!
//! - **[`sense`]** collects claims from the spec, git, the tracker, human
//!   input, and project learnings.
//! - **[`orient`]** asks a reasoning agent for a verdict, which
//!   **[`validate`]** checks against a schema and the claims.
//! - **[`reconcile`]** applies the verdict's task changes to the tracker, and
//!   [`core::decide`] routes to DONE, STUCK, or CONTINUE.
//! - **[`act`]** executes eligible tasks on an iteration branch and merges
//!   the result into the milestone branch.
//!
//! Pure logic lives in [`core`]; side effects live in [`io`]. [`looping`],
//! [`start`], and [`report`] tie them together for the CLI.

pub mod act;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orient;
pub mod reconcile;
pub mod report;
pub mod sense;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
