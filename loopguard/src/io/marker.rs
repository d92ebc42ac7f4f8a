//! Autonomous-mode marker file.
//!
//! Presence of the marker means at-exit requires a completion marker.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::clock;

pub fn is_autonomous(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file(),
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            warn!(
                path = %path.display(),
                err = %err,
                "cannot stat autonomous marker; assuming off"
            );
            false
        }
    }
}

/// Create or remove the marker. Idempotent.
pub fn set_autonomous(path: &Path, enabled: bool) -> Result<()> {
    if enabled {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(path, format!("enabled_at = \"{}\"\n", clock::now()))
            .with_context(|| format!("write {}", path.display()))?;
    } else {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove {}", path.display()));
            }
        }
    }
    info!(enabled, "autonomous mode updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".loopguard").join("autonomous");
        assert!(!is_autonomous(&path));

        set_autonomous(&path, true).expect("on");
        set_autonomous(&path, true).expect("on again");
        assert!(is_autonomous(&path));

        set_autonomous(&path, false).expect("off");
        set_autonomous(&path, false).expect("off again");
        assert!(!is_autonomous(&path));
    }
}
