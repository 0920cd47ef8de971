//! Stable exit codes for `sate` commands.

/// Run finished (normally or on a time/iteration limit), or the config was exported.
pub const OK: i32 = 0;
/// Invalid settings or input, or a fatal tool error.
pub const INVALID: i32 = 1;
/// The run was interrupted by a signal.
pub const CANCELLED: i32 = 130;
