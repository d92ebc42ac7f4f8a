//! On-disk mirror of the breaker record (`.loopguard/breaker.json`).
//!
//! The store stays authoritative. The cache only answers "is the breaker open"
//! while the store is missing or being rebuilt, and is safe to lose.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::breaker::BreakerSnapshot;

/// Load the cached breaker record.
pub fn load_breaker_cache(path: &Path) -> Result<BreakerSnapshot> {
    debug!(path = %path.display(), "loading breaker cache");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read breaker cache {}", path.display()))?;
    let snapshot: BreakerSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse breaker cache {}", path.display()))?;
    debug!(
        state = snapshot.state.as_str(),
        consecutive_failures = snapshot.consecutive_failures,
        "breaker cache loaded"
    );
    Ok(snapshot)
}

/// Atomically write the breaker record (temp file + rename).
pub fn write_breaker_cache(path: &Path, snapshot: &BreakerSnapshot) -> Result<()> {
    debug!(
        path = %path.display(),
        state = snapshot.state.as_str(),
        consecutive_failures = snapshot.consecutive_failures,
        "writing breaker cache"
    );
    let mut buf = serde_json::to_string_pretty(snapshot)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
