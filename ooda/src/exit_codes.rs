//! Stable exit codes for ooda CLI commands.

/// Run finished DONE, STUCK with a reason, or paused; other commands succeeded.
pub const OK: i32 = 0;
/// Structural halt, invalid layout/config, or any other error.
pub const HALT: i32 = 1;
/// The iteration limit was reached before the run finished.
pub const MAX_ITERATIONS: i32 = 2;
/// Ctrl-C stopped the run at an external-call boundary.
pub const INTERRUPTED: i32 = 3;
