//! Stable exit codes for loopguard commands.
//!
//! Hosts read a hook's exit status as its decision, so these values are part
//! of the hook contract.

/// The action may proceed (or the operator command succeeded).
pub const ALLOW: i32 = 0;
/// Internal failure. Hosts treat anything other than [`BLOCK`] as allow.
pub const ERROR: i32 = 1;
/// The action is refused; guidance is on stderr.
pub const BLOCK: i32 = 2;
