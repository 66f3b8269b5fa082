//! Stable exit codes for `stagehand` commands.

/// Command succeeded (for `run`: the session reached `done` or the step limit).
pub const OK: i32 = 0;
/// Invalid arguments, configuration, I/O, or extraction failure.
pub const ERROR: i32 = 1;
/// Persisted session was started with a different stage list or iteration cap.
pub const CONFIG_MISMATCH: i32 = 2;
/// A stage failed; the session is resumable with the same `--session`.
pub const STAGE_FAILED: i32 = 3;
