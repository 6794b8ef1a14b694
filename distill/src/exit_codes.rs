//! Stable exit codes for distill CLI commands.

/// Command succeeded; for `ask`, the supervisor called `FINAL`.
pub const OK: i32 = 0;
/// Invalid config or arguments, or the run aborted.
pub const ERROR: i32 = 1;
/// `distill ask` ran out of iterations and answered with the raw forced reply.
pub const FALLBACK: i32 = 2;
