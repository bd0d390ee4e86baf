//! Deterministic, pure logic for the control plane.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod baseline;
pub mod claims;
pub mod decide;
pub mod learnings;
pub mod loop_detect;
pub mod reconcile;
pub mod retry;
pub mod summary;
pub mod task_arena;
pub mod types;
pub mod verdict_check;
