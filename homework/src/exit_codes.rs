//! Stable exit codes for homework CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid input, config, or storage errors.
pub const INVALID: i32 = 1;
/// `homework status` found the run `failed`.
pub const RUN_FAILED: i32 = 2;
/// `homework status` found the run waiting on an answer.
pub const WAITING_ON_USER: i32 = 3;
