//! Stable exit codes for loopsmith CLI commands.
//!
//! `loopsmith run` reports blocked tasks through its summary line and exits
//! with [`OK`]; callers inspect the summary or `loopsmith status`.

/// Command succeeded or an eligible task was selected.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/state or other errors.
pub const INVALID: i32 = 1;
/// `loopsmith select` found no eligible task (plan complete).
pub const COMPLETE: i32 = 2;
/// A run was refused before starting (configuration error, lock held, or
/// invoked from inside the work session).
pub const PREFLIGHT: i32 = 4;
