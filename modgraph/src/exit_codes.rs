//! Stable exit codes for `modgraph` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input: unreadable graph/settings, bad path, or other errors.
pub const INVALID: i32 = 1;
/// `modgraph get-lm` found predictors bound to different LMs.
pub const INCONSISTENT_LM: i32 = 2;
/// An experimental command ran without `experimental = true`.
pub const FEATURE_GATED: i32 = 3;
