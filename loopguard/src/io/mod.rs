//! Side-effecting helpers: state store, files under `.loopguard/`, git, templates.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod accessor;
pub mod breaker_cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod git;
pub mod guidance;
pub mod hook_input;
pub mod init;
pub mod marker;
pub mod process;
pub mod store;

/// Atomically replace `path` (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let ext = path
        .extension()
        .map(|ext| format!("{}.tmp", ext.to_string_lossy()))
        .unwrap_or_else(|| "tmp".to_string());
    let tmp_path = path.with_extension(ext);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
