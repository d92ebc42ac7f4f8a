//! Persistent control loop for autonomous coding agents.
//!
//! A host runs `loopguard hook <event>` at each lifecycle point of an agent
//! session. Every invocation is a fresh process: it loads loop state from the
//! project's `.loopguard/` store, decides allow or block, persists, and exits.
//! The architecture keeps the usual split:
//!
//! - **[`core`]**: Pure, deterministic decisions (scope rules, abandonment
//!   classification, breaker arithmetic, attempt state machine). No I/O.
//! - **[`io`]**: Store, config, git queries, and file artifacts. Hook paths go
//!   through the fail-open [`io::accessor::Accessor`].
//!
//! Orchestration modules ([`dispatch`], [`session`], [`checkpoint`]) combine
//! the two to implement hooks and operator commands.

pub mod checkpoint;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
pub mod session_context;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
