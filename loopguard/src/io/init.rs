//! Canonical `.loopguard/` layout and scaffolding.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::breaker_cache::write_breaker_cache;
use super::config::{LoopConfig, write_config};
use super::store::Store;
use crate::core::breaker::BreakerSnapshot;

/// State directory name, relative to the project root.
pub const STATE_DIR: &str = ".loopguard";

/// Environment variable overriding the project root.
pub const ROOT_ENV: &str = "LOOPGUARD_ROOT";

/// All canonical paths within `.loopguard/` for a project root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub breaker_cache_path: PathBuf,
    pub autonomous_marker_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub checkpoint_index_path: PathBuf,
    pub context_dir: PathBuf,
    pub resume_note_path: PathBuf,
    pub logs_dir: PathBuf,
    pub log_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        let checkpoints_dir = state_dir.join("checkpoints");
        let context_dir = state_dir.join("context");
        let logs_dir = state_dir.join("logs");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            db_path: state_dir.join("state.db"),
            config_path: state_dir.join("config.toml"),
            breaker_cache_path: state_dir.join("breaker.json"),
            autonomous_marker_path: state_dir.join("autonomous"),
            checkpoints_dir: checkpoints_dir.clone(),
            checkpoint_index_path: checkpoints_dir.join("index.json"),
            context_dir: context_dir.clone(),
            resume_note_path: context_dir.join("resume.md"),
            logs_dir: logs_dir.clone(),
            log_path: logs_dir.join("loopguard.log"),
            gitignore_path: state_dir.join(".gitignore"),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }
}

/// Resolve the project root: `LOOPGUARD_ROOT` if set, else the working directory.
pub fn project_root() -> Result<PathBuf> {
    match env::var_os(ROOT_ENV) {
        Some(root) if !root.is_empty() => Ok(PathBuf::from(root)),
        _ => env::current_dir().context("resolve current directory"),
    }
}

/// Options for `init_state`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, rewrite config and ignore files. The database is never replaced.
    pub force: bool,
}

/// Create `.loopguard/` scaffolding in `root` and bootstrap the store.
///
/// Fails if `.loopguard/` already exists unless `options.force` is set.
pub fn init_state(root: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: {STATE_DIR} exists but is not a directory"));
    }
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: {STATE_DIR} already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.checkpoints_dir)?;
    create_dir(&paths.context_dir)?;
    create_dir(&paths.logs_dir)?;

    write_file(&paths.gitignore_path, STATE_GITIGNORE)?;
    let config = LoopConfig::default();
    write_config(&paths.config_path, &config)?;
    if !paths.breaker_cache_path.exists() {
        write_breaker_cache(
            &paths.breaker_cache_path,
            &BreakerSnapshot::new(config.max_failures),
        )?;
    }

    let store = Store::open(&paths.db_path, &config.store)?;
    info!(
        root = %root.display(),
        schema_version = store.schema_version()?,
        "state directory initialized"
    );
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const STATE_GITIGNORE: &str = "*\n!.gitignore\n!config.toml\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.checkpoints_dir.is_dir());
        assert!(paths.context_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.db_path.is_file());
        assert!(paths.config_path.is_file());
        assert!(paths.breaker_cache_path.is_file());
        assert!(!paths.autonomous_marker_path.exists());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            STATE_GITIGNORE
        );
    }

    #[test]
    fn init_without_force_refuses_existing_state_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_state(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_state(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_config_but_keeps_database() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_iterations = 3\n").expect("write custom");
        let db_before = fs::metadata(&paths.db_path).expect("meta").len();

        init_state(temp.path(), &InitOptions { force: true }).expect("re-init");

        let cfg = crate::io::config::load_config(&paths.config_path).expect("load");
        assert_eq!(cfg, LoopConfig::default());
        assert!(fs::metadata(&paths.db_path).expect("meta").len() >= db_before);
    }
}
