//! Stable exit codes for patchbee CLI commands.

/// Command succeeded; for `auto`, the verification command passed.
pub const OK: i32 = 0;
/// Invalid arguments or configuration, or a fatal backend/verification/workspace error.
pub const INVALID: i32 = 1;
/// `patchbee auto` used every iteration without a passing verification.
pub const EXHAUSTED: i32 = 2;
