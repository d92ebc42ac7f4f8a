//! Operator-driven session and task lifecycle.
//!
//! Unlike the hooks, these operations surface every store error: an operator
//! asked for the change and needs to know when it did not happen.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::attempt::{AttemptEvent, AttemptState, transition};
use crate::core::breaker::BreakerSnapshot;
use crate::core::scope::{ScopeRules, ScopeVerdict, relativize};
use crate::core::types::{
    Event, EventCategory, ExecutionMode, ModelTier, NewEvent, Session, SessionStatus, Task,
    TaskStatus,
};
use crate::io::breaker_cache::{load_breaker_cache, write_breaker_cache};
use crate::io::clock;
use crate::io::config::LoopConfig;
use crate::io::accessor::Accessor;
use crate::io::init::StatePaths;
use crate::io::marker::{is_autonomous, set_autonomous};
use crate::io::store::{FieldValue, SessionField, Store};

const RECENT_EVENT_LIMIT: usize = 10;

/// Options for `session start`.
#[derive(Debug, Clone)]
pub struct StartSession {
    pub command: String,
    pub mode: ExecutionMode,
    /// Overrides `max_iterations` from config.
    pub max_iterations: Option<u32>,
}

/// Options for `task add`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: Option<String>,
    pub title: String,
    pub scope: ScopeRules,
    pub depends_on: Vec<String>,
}

/// Snapshot printed by `session status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session: Option<Session>,
    pub active_task: Option<Task>,
    pub tasks: Vec<Task>,
    pub breaker: BreakerSnapshot,
    pub autonomous: bool,
    pub escalations: usize,
    pub recent_events: Vec<Event>,
}

fn log_event(
    store: &Store,
    session_id: Option<&str>,
    category: EventCategory,
    kind: &str,
    message: String,
    payload: Value,
) -> Result<()> {
    store.append_event(&NewEvent {
        session_id: session_id.map(str::to_string),
        kind: kind.to_string(),
        category,
        message,
        payload,
    })?;
    Ok(())
}

fn live_session(store: &Store) -> Result<Option<Session>> {
    Ok(store.latest_session()?.filter(|s| !s.status.is_terminal()))
}

fn require_task(store: &Store, id: &str) -> Result<Task> {
    store
        .task(id)?
        .ok_or_else(|| anyhow!("task {id} not found"))
}

#[instrument(skip_all, fields(command = %opts.command))]
pub fn start_session(
    store: &Store,
    paths: &StatePaths,
    cfg: &LoopConfig,
    opts: &StartSession,
) -> Result<Session> {
    if let Some(current) = live_session(store)? {
        bail!(
            "session {} is still {}; end it first",
            current.id,
            current.status.as_str()
        );
    }
    let max_iterations = opts.max_iterations.unwrap_or(cfg.max_iterations);
    if max_iterations == 0 {
        bail!("max_iterations must be > 0");
    }
    let now = clock::now();
    let session = Session {
        id: clock::new_id("ses"),
        command: opts.command.clone(),
        status: SessionStatus::Running,
        phase: String::new(),
        model_tier: ModelTier::Tier1,
        iteration: 0,
        max_iterations,
        consecutive_failures: 0,
        mode: opts.mode,
        cost_usd: 0.0,
        input_tokens: 0,
        output_tokens: 0,
        created_at: now.clone(),
        updated_at: now,
    };
    store.insert_session(&session)?;

    let breaker = BreakerSnapshot::new(cfg.max_failures);
    store.save_breaker(&session.id, &breaker)?;
    write_breaker_cache(&paths.breaker_cache_path, &breaker)?;
    log_event(
        store,
        Some(&session.id),
        EventCategory::Lifecycle,
        "session_started",
        format!("session started: {}", session.command),
        json!({ "mode": session.mode.as_str(), "max_iterations": max_iterations }),
    )?;
    info!(session_id = %session.id, "session started");
    Ok(session)
}

/// Move the live session to a terminal status.
pub fn end_session(store: &Store, status: SessionStatus) -> Result<Session> {
    if !status.is_terminal() {
        bail!("a session can only end as completed, failed or aborted");
    }
    let mut session = live_session(store)?.context("no live session to end")?;
    session.status = status;
    session.updated_at = clock::now();
    store.update_session(&session)?;
    log_event(
        store,
        Some(&session.id),
        EventCategory::Lifecycle,
        "session_ended",
        format!("session ended as {}", status.as_str()),
        json!({ "iteration": session.iteration }),
    )?;
    info!(session_id = %session.id, status = status.as_str(), "session ended");
    Ok(session)
}

pub fn session_status(store: &Store, paths: &StatePaths, cfg: &LoopConfig) -> Result<StatusReport> {
    let session = store.latest_session()?;
    let session_id = session.as_ref().map(|s| s.id.clone());
    let breaker = match session_id.as_deref() {
        Some(id) => store.breaker(id)?,
        None => None,
    };
    let breaker = match breaker {
        Some(b) => b,
        None => load_breaker_cache(&paths.breaker_cache_path)
            .unwrap_or_else(|_| BreakerSnapshot::new(cfg.max_failures)),
    };
    let (escalations, recent_events) = match session_id.as_deref() {
        Some(id) => (
            store.escalations(id)?.len(),
            store.recent_events(id, RECENT_EVENT_LIMIT)?,
        ),
        None => (0, Vec::new()),
    };
    Ok(StatusReport {
        active_task: store.active_task(session_id.as_deref())?,
        tasks: store.tasks(session_id.as_deref())?,
        session,
        breaker,
        autonomous: is_autonomous(&paths.autonomous_marker_path),
        escalations,
        recent_events,
    })
}

/// Add a pending task, attached to the live session if there is one.
pub fn add_task(store: &Store, new: NewTask) -> Result<Task> {
    if new.title.trim().is_empty() {
        bail!("task title must not be empty");
    }
    let session = live_session(store)?;
    let now = clock::now();
    let task = Task {
        id: new.id.unwrap_or_else(|| clock::new_id("task")),
        session_id: session.as_ref().map(|s| s.id.clone()),
        title: new.title,
        status: TaskStatus::Pending,
        scope: new.scope,
        model_tier: session.as_ref().map(|s| s.model_tier).unwrap_or_default(),
        iteration: 0,
        attempt_state: AttemptState::Queued,
        depends_on: new.depends_on,
        created_at: now.clone(),
        updated_at: now,
    };
    store
        .insert_task(&task)
        .with_context(|| format!("add task {}", task.id))?;
    log_event(
        store,
        task.session_id.as_deref(),
        EventCategory::Lifecycle,
        "task_added",
        format!("task added: {}", task.title),
        json!({
            "task_id": task.id,
            "depends_on": task.depends_on,
            "rules": task.scope.rules.len(),
        }),
    )?;
    Ok(task)
}

/// Start a task once every dependency is completed. One task runs at a time.
pub fn start_task(store: &Store, id: &str) -> Result<Task> {
    let mut task = require_task(store, id)?;
    if !matches!(
        task.status,
        TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Failed
    ) {
        let status = task.status.as_str();
        bail!("task {id} is {status}; only pending, blocked or failed tasks can start");
    }

    let mut unmet = Vec::new();
    for dep in &task.depends_on {
        let done = store
            .task(dep)?
            .is_some_and(|d| d.status == TaskStatus::Completed);
        if !done {
            unmet.push(dep.clone());
        }
    }
    if !unmet.is_empty() {
        bail!(
            "task {id} is waiting on unfinished dependencies: {}",
            unmet.join(", ")
        );
    }

    let session = live_session(store)?;
    if task.session_id.is_none() {
        task.session_id = session.as_ref().map(|s| s.id.clone());
    }
    if let Some(running) = store.active_task(task.session_id.as_deref())?
        && running.id != task.id
    {
        bail!(
            "task {} is already in progress; complete or fail it first",
            running.id
        );
    }

    let from = if task.attempt_state.is_terminal() {
        AttemptState::Queued
    } else {
        task.attempt_state
    };
    task.attempt_state = transition(from, AttemptEvent::Start).map_err(|err| anyhow!(err))?;
    task.status = TaskStatus::InProgress;
    if let Some(session) = session.as_ref() {
        task.model_tier = session.model_tier;
    }
    task.updated_at = clock::now();
    store.update_task(&task)?;
    log_event(
        store,
        task.session_id.as_deref(),
        EventCategory::Lifecycle,
        "task_started",
        format!("task started: {}", task.title),
        json!({ "task_id": task.id }),
    )?;
    info!(task_id = %task.id, "task started");
    Ok(task)
}

/// Complete the running task and drop the session back to the base tier.
pub fn complete_task(store: &Store, id: &str) -> Result<Task> {
    let mut task = require_task(store, id)?;
    if task.status != TaskStatus::InProgress {
        let status = task.status.as_str();
        bail!("task {id} is {status}; only an in-progress task can complete");
    }
    task.attempt_state = transition(task.attempt_state, AttemptEvent::Complete)
        .map_err(|err| anyhow!("{err}; run the gates until they pass first"))?;
    task.status = TaskStatus::Completed;
    task.updated_at = clock::now();
    store.update_task(&task)?;

    if let Some(session_id) = task.session_id.as_deref()
        && let Some(mut session) = store.session(session_id)?
    {
        session.model_tier = ModelTier::Tier1;
        session.consecutive_failures = 0;
        session.updated_at = task.updated_at.clone();
        store.update_session(&session)?;
    }
    log_event(
        store,
        task.session_id.as_deref(),
        EventCategory::Lifecycle,
        "task_completed",
        format!("task completed: {}", task.title),
        json!({ "task_id": task.id, "iterations": task.iteration }),
    )?;
    info!(task_id = %task.id, "task completed");
    Ok(task)
}

pub fn fail_task(store: &Store, id: &str, reason: &str) -> Result<Task> {
    let mut task = require_task(store, id)?;
    if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
        bail!("task {id} is already {}", task.status.as_str());
    }
    if !task.attempt_state.is_terminal() {
        task.attempt_state =
            transition(task.attempt_state, AttemptEvent::Handoff).map_err(|err| anyhow!(err))?;
    }
    task.status = TaskStatus::Failed;
    task.updated_at = clock::now();
    store.update_task(&task)?;
    log_event(
        store,
        task.session_id.as_deref(),
        EventCategory::Lifecycle,
        "task_failed",
        format!("task failed: {reason}"),
        json!({ "task_id": task.id, "reason": reason }),
    )?;
    Ok(task)
}

/// Replace a task's scope rules. A running task needs `force`.
pub fn set_task_scope(store: &Store, id: &str, scope: ScopeRules, force: bool) -> Result<Task> {
    let mut task = require_task(store, id)?;
    if task.status == TaskStatus::InProgress && !force {
        bail!("task {id} is in progress; its scope is frozen (pass --force to override)");
    }
    let previous = task.scope.to_rule_file();
    task.scope = scope;
    task.updated_at = clock::now();
    store.update_task(&task)?;
    if force && task.status == TaskStatus::InProgress {
        warn!(task_id = %task.id, "scope of running task replaced by operator");
    }
    log_event(
        store,
        task.session_id.as_deref(),
        EventCategory::Scope,
        "scope_changed",
        format!("scope of task {} replaced", task.id),
        json!({ "previous": previous, "current": task.scope.to_rule_file(), "forced": force }),
    )?;
    Ok(task)
}

/// Evaluate `path` against a task's scope (default: the active task).
pub fn check_scope(
    store: &Store,
    root: &Path,
    path: &str,
    task_id: Option<&str>,
) -> Result<(Task, ScopeVerdict)> {
    let task = match task_id {
        Some(id) => require_task(store, id)?,
        None => {
            let session = store.latest_session()?;
            store
                .active_task(session.as_ref().map(|s| s.id.as_str()))?
                .context("no active task; pass --task")?
        }
    };
    let verdict = task.scope.evaluate(&relativize(root, path));
    Ok((task, verdict))
}

/// Close the breaker. An aborted session and its task resume running.
pub fn reset_breaker(
    store: &Store,
    paths: &StatePaths,
    cfg: &LoopConfig,
) -> Result<BreakerSnapshot> {
    let Some(mut session) = store.latest_session()? else {
        let snapshot = BreakerSnapshot::new(cfg.max_failures);
        write_breaker_cache(&paths.breaker_cache_path, &snapshot)?;
        return Ok(snapshot);
    };
    let mut breaker = store
        .breaker(&session.id)?
        .unwrap_or_else(|| BreakerSnapshot::new(cfg.max_failures));
    let was_open = breaker.is_open();
    breaker.reset();
    store.save_breaker(&session.id, &breaker)?;
    write_breaker_cache(&paths.breaker_cache_path, &breaker)?;

    if session.status == SessionStatus::Aborted {
        session.status = SessionStatus::Running;
        session.consecutive_failures = 0;
        session.updated_at = clock::now();
        store.update_session(&session)?;
        if let Some(mut task) = store.active_task(Some(&session.id))?
            && task.attempt_state == AttemptState::Aborted
        {
            task.attempt_state = AttemptState::Running;
            task.updated_at = session.updated_at.clone();
            store.update_task(&task)?;
        }
    }
    log_event(
        store,
        Some(&session.id),
        EventCategory::Breaker,
        "breaker_reset",
        "breaker reset by operator".to_string(),
        json!({ "was_open": was_open }),
    )?;
    info!(session_id = %session.id, was_open, "breaker reset");
    Ok(breaker)
}

/// Read one column of the latest session. Fails open to `None`.
pub fn read_session_field(accessor: &Accessor, field: SessionField) -> Option<FieldValue> {
    let session = accessor.current_session()?;
    accessor.session_field(&session.id, field)
}

/// Overwrite one column of the live session.
pub fn write_session_field(
    accessor: &Accessor,
    field: SessionField,
    raw: &str,
) -> Result<FieldValue> {
    let Some(value) = field.parse_value(raw) else {
        bail!("invalid value {raw:?} for {}", field.column());
    };
    let session = accessor
        .current_session()
        .filter(|s| !s.status.is_terminal())
        .context("no live session")?;
    if !accessor.set_session_field(&session.id, field, &value) {
        bail!(
            "could not write {} of session {}",
            field.column(),
            session.id
        );
    }
    accessor.append_event(&NewEvent {
        session_id: Some(session.id.clone()),
        kind: "session_field_set".to_string(),
        category: EventCategory::Lifecycle,
        message: format!("{} set by operator", field.column()),
        payload: json!({ "field": field.column(), "value": value.as_text() }),
    });
    info!(session_id = %session.id, field = field.column(), "session field set");
    Ok(value)
}

/// Toggle autonomous mode and record it on the live session.
pub fn set_autonomous_mode(store: Option<&Store>, paths: &StatePaths, enabled: bool) -> Result<()> {
    set_autonomous(&paths.autonomous_marker_path, enabled)?;
    if let Some(store) = store {
        let session = live_session(store)?;
        log_event(
            store,
            session.as_ref().map(|s| s.id.as_str()),
            EventCategory::Lifecycle,
            if enabled { "autonomous_on" } else { "autonomous_off" },
            format!(
                "autonomous mode {}",
                if enabled { "enabled" } else { "disabled" }
            ),
            json!({}),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breaker::BreakerState;
    use crate::io::init::{InitOptions, init_state};

    fn setup() -> (tempfile::TempDir, StatePaths, Store, LoopConfig) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(temp.path(), &InitOptions { force: false }).expect("init");
        let store = Store::open(&paths.db_path, &Default::default()).expect("store");
        (temp, paths, store, LoopConfig::default())
    }

    fn start(store: &Store, paths: &StatePaths, cfg: &LoopConfig) -> Session {
        start_session(
            store,
            paths,
            cfg,
            &StartSession {
                command: "build".to_string(),
                mode: ExecutionMode::Normal,
                max_iterations: None,
            },
        )
        .expect("start")
    }

    fn task(id: &str, deps: &[&str]) -> NewTask {
        NewTask {
            id: Some(id.to_string()),
            title: format!("{id} title"),
            scope: ScopeRules::parse("+src/**\n").expect("rules"),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        }
    }

    #[test]
    fn only_one_live_session_at_a_time() {
        let (_temp, paths, store, cfg) = setup();
        let first = start(&store, &paths, &cfg);
        assert_eq!(first.max_iterations, 20);
        assert!(store.breaker(&first.id).expect("read").is_some());

        let opts = StartSession {
            command: "again".to_string(),
            mode: ExecutionMode::Eco,
            max_iterations: Some(5),
        };
        assert!(start_session(&store, &paths, &cfg, &opts).is_err());
        end_session(&store, SessionStatus::Completed).expect("end");
        let second = start_session(&store, &paths, &cfg, &opts).expect("second");
        assert_eq!(second.max_iterations, 5);
        assert_eq!(second.mode, ExecutionMode::Eco);
    }

    #[test]
    fn dependencies_gate_task_start() {
        let (_temp, paths, store, cfg) = setup();
        start(&store, &paths, &cfg);
        add_task(&store, task("a", &[])).expect("a");
        add_task(&store, task("b", &["a"])).expect("b");

        let err = start_task(&store, "b").expect_err("blocked by a");
        assert!(format!("{err:#}").contains("a"));

        let started = start_task(&store, "a").expect("start a");
        assert_eq!(started.attempt_state, AttemptState::Running);
        assert!(start_task(&store, "b").is_err());
    }

    #[test]
    fn completion_needs_a_passing_attempt_and_resets_the_ladder() {
        let (_temp, paths, store, cfg) = setup();
        let session = start(&store, &paths, &cfg);
        add_task(&store, task("a", &[])).expect("a");
        let mut running = start_task(&store, "a").expect("start");

        running.attempt_state = AttemptState::GateFailed;
        store.update_task(&running).expect("fail gate");
        let mut escalated = store.session(&session.id).expect("read").expect("session");
        escalated.model_tier = ModelTier::Tier3;
        store.update_session(&escalated).expect("escalate");
        assert!(complete_task(&store, "a").is_err());

        running.attempt_state = AttemptState::GatePassed;
        store.update_task(&running).expect("pass gate");
        let done = complete_task(&store, "a").expect("complete");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt_state, AttemptState::Completed);
        let session = store.session(&session.id).expect("read").expect("session");
        assert_eq!(session.model_tier, ModelTier::Tier1);
    }

    #[test]
    fn running_task_scope_needs_force() {
        let (_temp, paths, store, cfg) = setup();
        start(&store, &paths, &cfg);
        add_task(&store, task("a", &[])).expect("a");
        let wider = ScopeRules::parse("+**\n").expect("rules");

        set_task_scope(&store, "a", wider.clone(), false).expect("pending task is editable");
        start_task(&store, "a").expect("start");
        assert!(set_task_scope(&store, "a", wider.clone(), false).is_err());
        let forced = set_task_scope(&store, "a", wider, true).expect("forced");
        assert_eq!(forced.scope.allow_patterns(), vec!["**".to_string()]);
    }

    #[test]
    fn reset_reopens_an_aborted_session() {
        let (_temp, paths, store, cfg) = setup();
        let session = start(&store, &paths, &cfg);
        add_task(&store, task("a", &[])).expect("a");
        let mut running = start_task(&store, "a").expect("start");
        running.attempt_state = AttemptState::Aborted;
        store.update_task(&running).expect("abort task");
        let mut aborted = store.session(&session.id).expect("read").expect("session");
        aborted.status = SessionStatus::Aborted;
        store.update_session(&aborted).expect("abort");
        let mut open = BreakerSnapshot::new(5);
        open.state = BreakerState::Open;
        open.consecutive_failures = 5;
        store.save_breaker(&session.id, &open).expect("open");

        let reset = reset_breaker(&store, &paths, &cfg).expect("reset");
        assert_eq!(reset.state, BreakerState::Closed);
        assert_eq!(reset.consecutive_failures, 0);
        let session = store.session(&session.id).expect("read").expect("session");
        assert_eq!(session.status, SessionStatus::Running);
        let task = store.task("a").expect("read").expect("task");
        assert_eq!(task.attempt_state, AttemptState::Running);
        let cached = load_breaker_cache(&paths.breaker_cache_path).expect("cache");
        assert_eq!(cached, reset);
    }

    #[test]
    fn scope_check_uses_the_active_task() {
        let (temp, paths, store, cfg) = setup();
        start(&store, &paths, &cfg);
        add_task(&store, task("a", &[])).expect("a");
        assert!(check_scope(&store, temp.path(), "src/lib.rs", None).is_err());
        start_task(&store, "a").expect("start");

        let (task, verdict) = check_scope(&store, temp.path(), "src/lib.rs", None).expect("check");
        assert_eq!(task.id, "a");
        assert!(verdict.is_allowed());
        let outside = temp.path().join("README.md");
        let (_, verdict) =
            check_scope(&store, temp.path(), &outside.to_string_lossy(), Some("a")).expect("check");
        assert!(!verdict.is_allowed());
    }

    #[test]
    fn status_reports_breaker_and_flag() {
        let (_temp, paths, store, cfg) = setup();
        start(&store, &paths, &cfg);
        set_autonomous_mode(Some(&store), &paths, true).expect("on");
        let report = session_status(&store, &paths, &cfg).expect("status");
        assert!(report.autonomous);
        assert_eq!(report.breaker.threshold, 5);
        let events = &report.recent_events;
        assert!(events.iter().any(|e| e.kind == "autonomous_on"));
    }

    #[test]
    fn session_fields_are_validated_and_logged() {
        let (_temp, paths, store, cfg) = setup();
        let session = start(&store, &paths, &cfg);
        let accessor =
            Accessor::from_store(Store::open(&paths.db_path, &Default::default()).expect("store"));

        let written =
            write_session_field(&accessor, SessionField::MaxIterations, "40").expect("write");
        assert_eq!(written, FieldValue::Int(40));
        assert_eq!(
            read_session_field(&accessor, SessionField::MaxIterations),
            Some(FieldValue::Int(40))
        );
        assert!(write_session_field(&accessor, SessionField::ModelTier, "tier9").is_err());
        assert!(write_session_field(&accessor, SessionField::CostUsd, "-1").is_err());

        let events = store.recent_events(&session.id, 10).expect("events");
        let sets = events.iter().filter(|e| e.kind == "session_field_set");
        assert_eq!(sets.count(), 1);

        end_session(&store, SessionStatus::Completed).expect("end");
        assert!(write_session_field(&accessor, SessionField::Phase, "verify").is_err());
        assert_eq!(
            read_session_field(&accessor, SessionField::Status),
            Some(FieldValue::Text("completed".to_string()))
        );
    }
}
