//! Test-only helpers for building rows, projects, and hook inputs.

use anyhow::{Context, Result};
use serde_json::json;
use tempfile::TempDir;

use crate::core::attempt::AttemptState;
use crate::core::scope::ScopeRules;
use crate::core::types::{ExecutionMode, ModelTier, Session, SessionStatus, Task, TaskStatus};
use crate::io::accessor::Accessor;
use crate::io::config::{LoopConfig, load_config};
use crate::io::hook_input::HookInput;
use crate::io::init::{InitOptions, StatePaths, init_state};
use crate::io::marker;
use crate::io::store::Store;
use crate::session::{StartSession, start_session};
use crate::session_context::SessionContext;

const FIXED_TIME: &str = "2026-01-01T00:00:00Z";

/// A running tier-1 session with deterministic fields.
pub fn session_row(id: &str) -> Session {
    Session {
        id: id.to_string(),
        command: "test".to_string(),
        status: SessionStatus::Running,
        phase: String::new(),
        model_tier: ModelTier::Tier1,
        iteration: 0,
        max_iterations: 20,
        consecutive_failures: 0,
        mode: ExecutionMode::Normal,
        cost_usd: 0.0,
        input_tokens: 0,
        output_tokens: 0,
        created_at: FIXED_TIME.to_string(),
        updated_at: FIXED_TIME.to_string(),
    }
}

/// A pending task with no scope rules.
pub fn task_row(id: &str, session_id: Option<&str>) -> Task {
    Task {
        id: id.to_string(),
        session_id: session_id.map(str::to_string),
        title: format!("{id} title"),
        status: TaskStatus::Pending,
        scope: ScopeRules::default(),
        model_tier: ModelTier::Tier1,
        iteration: 0,
        attempt_state: AttemptState::Queued,
        depends_on: Vec::new(),
        created_at: FIXED_TIME.to_string(),
        updated_at: FIXED_TIME.to_string(),
    }
}

/// A project root in a temporary directory.
pub struct TestProject {
    _dir: TempDir,
    paths: StatePaths,
}

impl TestProject {
    /// Initialized project with default config.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let paths = init_state(dir.path(), &InitOptions { force: false })?;
        Ok(Self { _dir: dir, paths })
    }

    /// Project that was never initialized.
    pub fn bare() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let paths = StatePaths::new(dir.path());
        Ok(Self { _dir: dir, paths })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn config(&self) -> LoopConfig {
        load_config(&self.paths.config_path).unwrap_or_default()
    }

    pub fn context(&self) -> SessionContext {
        SessionContext::load(self.paths.clone())
    }

    /// Context whose store is unreachable; the rest of the state is on disk.
    pub fn context_without_store(&self) -> SessionContext {
        SessionContext::load_with(self.paths.clone(), self.config(), Accessor::unavailable())
    }

    /// Fresh connection to the project's store. Panics if it cannot open.
    pub fn store(&self) -> Store {
        Store::open(&self.paths.db_path, &self.config().store).expect("open test store")
    }

    pub fn start_session(&self) -> Result<Session> {
        start_session(
            &self.store(),
            &self.paths,
            &self.config(),
            &StartSession {
                command: "test".to_string(),
                mode: ExecutionMode::Normal,
                max_iterations: None,
            },
        )
    }

    /// Id of the latest session. Panics if there is none.
    pub fn session_id(&self) -> String {
        self.session().id
    }

    pub fn session(&self) -> Session {
        self.store()
            .latest_session()
            .expect("read session")
            .expect("a session exists")
    }

    /// Insert a task already running in the latest session.
    pub fn start_task(&self, id: &str, scope: ScopeRules) -> Result<Task> {
        let session = self.session();
        let mut task = task_row(id, Some(&session.id));
        task.status = TaskStatus::InProgress;
        task.attempt_state = AttemptState::Running;
        task.model_tier = session.model_tier;
        task.scope = scope;
        self.store().insert_task(&task)?;
        Ok(task)
    }

    pub fn set_autonomous(&self, enabled: bool) -> Result<()> {
        marker::set_autonomous(&self.paths.autonomous_marker_path, enabled)
    }

    pub fn set_iteration(&self, iteration: u32) -> Result<()> {
        let mut session = self.session();
        session.iteration = iteration;
        self.store().update_session(&session)
    }
}

/// Shell action about to run `command`.
pub fn shell(command: &str) -> HookInput {
    HookInput {
        operation: Some("Bash".to_string()),
        input: json!({ "command": command }),
        ..HookInput::default()
    }
}

/// File write about to touch `path`.
pub fn before_write(path: &str) -> HookInput {
    HookInput {
        operation: Some("Write".to_string()),
        input: json!({ "file_path": path, "content": "" }),
        ..HookInput::default()
    }
}

/// Finished shell action with `stdout` and no exit status.
pub fn after_action(command: &str, stdout: &str) -> HookInput {
    HookInput {
        operation: Some("Bash".to_string()),
        input: json!({ "command": command }),
        result: json!({ "stdout": stdout }),
        ..HookInput::default()
    }
}

/// Agent's final message at exit.
pub fn at_exit(text: &str) -> HookInput {
    HookInput {
        output: Some(text.to_string()),
        ..HookInput::default()
    }
}
