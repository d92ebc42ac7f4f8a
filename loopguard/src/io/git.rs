//! Git lookups used by the safety checks.
//!
//! Every lookup runs under the sub-check timeout and fails open: a slow,
//! missing, or broken `git` yields `None`, never an error.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::process::run_command_with_timeout;

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Read-only repository facts needed before an action runs.
pub trait RepoState {
    /// Current branch, or `None` if unknown (detached HEAD, timeout, no repo).
    fn current_branch(&self) -> Option<String>;
    /// Paths staged for commit, or `None` if the lookup failed.
    fn staged_files(&self) -> Option<Vec<String>>;
}

/// `git` subprocess implementation of [`RepoState`].
#[derive(Debug, Clone)]
pub struct GitRepo {
    workdir: PathBuf,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    fn capture(&self, args: &[&str]) -> Option<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        match run_command_with_timeout(cmd, self.timeout, OUTPUT_LIMIT_BYTES) {
            Ok(out) if out.succeeded() => Some(out.stdout_text()),
            Ok(out) => {
                warn!(
                    args = %args.join(" "),
                    timed_out = out.timed_out,
                    "git lookup failed; continuing without it"
                );
                None
            }
            Err(err) => {
                warn!(args = %args.join(" "), err = %err, "git unavailable; continuing without it");
                None
            }
        }
    }
}

impl RepoState for GitRepo {
    #[instrument(skip_all)]
    fn current_branch(&self) -> Option<String> {
        let out = self.capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim();
        if name.is_empty() || name == "HEAD" {
            debug!("detached or unknown HEAD");
            return None;
        }
        debug!(branch = %name, "current branch");
        Some(name.to_string())
    }

    #[instrument(skip_all)]
    fn staged_files(&self) -> Option<Vec<String>> {
        let out = self.capture(&["diff", "--cached", "--name-only"])?;
        Some(parse_name_list(&out))
    }
}

/// Repository that knows nothing; every check that needs git fails open.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepo;

impl RepoState for NoRepo {
    fn current_branch(&self) -> Option<String> {
        None
    }

    fn staged_files(&self) -> Option<Vec<String>> {
        None
    }
}

fn parse_name_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_only_output() {
        assert_eq!(
            parse_name_list("src/lib.rs\n\n  docs/a.md \n"),
            vec!["src/lib.rs".to_string(), "docs/a.md".to_string()]
        );
    }

    #[test]
    fn outside_a_repository_fails_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = GitRepo::new(temp.path(), Duration::from_secs(2));
        assert_eq!(repo.current_branch(), None);
        assert_eq!(repo.staged_files(), None);
    }
}
