//! Per-invocation view of loop state.
//!
//! A hook loads the context once, mutates it in memory, and persists it once in
//! a single store transaction. On-disk marker and cache files are serializations
//! of this value, not the state itself.
//!
//! The rows as loaded are kept alongside the working copy. Persisting sends
//! both, and the store folds the difference into whatever the rows hold at
//! commit time, so overlapping invocations do not overwrite each other.

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::breaker::BreakerSnapshot;
use crate::core::types::{
    CheckpointPayload, Escalation, EventCategory, GateResult, ModelTier, NewEvent, Session, Task,
};
use crate::io::accessor::Accessor;
use crate::io::breaker_cache::{load_breaker_cache, write_breaker_cache};
use crate::io::clock;
use crate::io::config::{LoopConfig, load_config};
use crate::io::init::StatePaths;
use crate::io::marker::is_autonomous;
use crate::io::store::{PersistBatch, RowUpdate};

pub struct SessionContext {
    pub paths: StatePaths,
    pub config: LoopConfig,
    accessor: Accessor,
    pub session: Option<Session>,
    pub task: Option<Task>,
    pub breaker: BreakerSnapshot,
    pub autonomous: bool,
    loaded_session: Option<Session>,
    loaded_task: Option<Task>,
    loaded_breaker: BreakerSnapshot,
    session_dirty: bool,
    task_dirty: bool,
    breaker_dirty: bool,
    events: Vec<NewEvent>,
    escalations: Vec<Escalation>,
    gates: Vec<GateResult>,
}

impl SessionContext {
    /// Load config, open the store, and read the current session.
    ///
    /// Never fails: a broken config falls back to defaults and a broken store
    /// reads as "no prior state".
    pub fn load(paths: StatePaths) -> Self {
        let config = load_config(&paths.config_path).unwrap_or_else(|err| {
            warn!(
                err = format!("{err:#}"),
                "config unreadable; using defaults"
            );
            LoopConfig::default()
        });
        let accessor = Accessor::open(&paths, &config.store);
        Self::load_with(paths, config, accessor)
    }

    pub fn load_with(paths: StatePaths, config: LoopConfig, accessor: Accessor) -> Self {
        let session = accessor.current_session();
        let task = session
            .as_ref()
            .and_then(|s| accessor.current_task(Some(&s.id)));
        let breaker = load_breaker(&paths, &config, &accessor, session.as_ref());
        let autonomous = is_autonomous(&paths.autonomous_marker_path);
        debug!(
            session_id = ?session.as_ref().map(|s| &s.id),
            task_id = ?task.as_ref().map(|t| &t.id),
            breaker = breaker.state.as_str(),
            autonomous,
            store = accessor.is_available(),
            "session context loaded"
        );
        Self {
            paths,
            config,
            accessor,
            loaded_session: session.clone(),
            loaded_task: task.clone(),
            loaded_breaker: breaker.clone(),
            session,
            task,
            breaker,
            autonomous,
            session_dirty: false,
            task_dirty: false,
            breaker_dirty: false,
            events: Vec::new(),
            escalations: Vec::new(),
            gates: Vec::new(),
        }
    }

    pub fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task.as_ref().map(|t| t.id.as_str())
    }

    /// Tier of the current session; the entry tier without one.
    pub fn model_tier(&self) -> ModelTier {
        self.session
            .as_ref()
            .map(|s| s.model_tier)
            .unwrap_or_default()
    }

    /// The current session, if it exists and is not finished.
    pub fn live_session(&self) -> Option<&Session> {
        self.session.as_ref().filter(|s| !s.status.is_terminal())
    }

    pub fn touch_session(&mut self) {
        self.session_dirty = true;
    }

    pub fn touch_task(&mut self) {
        self.task_dirty = true;
    }

    pub fn touch_breaker(&mut self) {
        self.breaker_dirty = true;
    }

    pub fn record(
        &mut self,
        category: EventCategory,
        kind: &str,
        message: impl Into<String>,
        payload: Value,
    ) {
        self.events.push(NewEvent {
            session_id: self.session_id().map(str::to_string),
            kind: kind.to_string(),
            category,
            message: message.into(),
            payload,
        });
    }

    pub fn record_escalation(&mut self, escalation: Escalation) {
        self.escalations.push(escalation);
    }

    pub fn record_gate(&mut self, gate: GateResult) {
        self.gates.push(gate);
    }

    /// Snapshot for a checkpoint.
    pub fn snapshot(&self, reason: &str) -> CheckpointPayload {
        CheckpointPayload {
            session_id: self.session_id().map(str::to_string),
            task_id: self.task_id().map(str::to_string),
            session_status: self.session.as_ref().map(|s| s.status),
            task_status: self.task.as_ref().map(|t| t.status),
            attempt_state: self.task.as_ref().map(|t| t.attempt_state),
            model_tier: self.model_tier(),
            iteration: self.session.as_ref().map_or(0, |s| s.iteration),
            task_iteration: self.task.as_ref().map_or(0, |t| t.iteration),
            consecutive_failures: self
                .session
                .as_ref()
                .map_or(0, |s| s.consecutive_failures),
            breaker: self.breaker.clone(),
            autonomous: self.autonomous,
            reason: reason.to_string(),
        }
    }

    /// A rejected batch loses its state changes, but events and escalation
    /// rows are retried one at a time so the audit trail keeps what it can.
    fn salvage_audit_trail(&self) {
        if !self.accessor.is_available() {
            return;
        }
        let events = self
            .events
            .iter()
            .filter(|event| self.accessor.append_event(event).is_some())
            .count();
        let escalations = self
            .escalations
            .iter()
            .filter(|e| self.accessor.record_escalation(e).is_some())
            .count();
        warn!(
            events,
            escalations, "state batch rejected; audit rows written individually"
        );
    }

    /// Write every pending change in one transaction, then refresh the breaker
    /// cache. Returns whether the store accepted the batch.
    pub fn persist(mut self) -> bool {
        let now = clock::now();
        if self.session_dirty
            && let Some(session) = self.session.as_mut()
        {
            session.updated_at = now.clone();
        }
        if self.task_dirty
            && let Some(task) = self.task.as_mut()
        {
            task.updated_at = now;
        }

        let nothing_pending = !self.session_dirty
            && !self.task_dirty
            && !self.breaker_dirty
            && self.events.is_empty()
            && self.escalations.is_empty()
            && self.gates.is_empty();
        if nothing_pending {
            return true;
        }

        let session_id = self.session_id().map(str::to_string);
        let batch = PersistBatch {
            session: merge(self.session_dirty, &self.loaded_session, &self.session),
            task: merge(self.task_dirty, &self.loaded_task, &self.task),
            breaker: session_id
                .as_deref()
                .filter(|_| self.breaker_dirty)
                .map(|id| {
                    let update = RowUpdate::Merge {
                        loaded: &self.loaded_breaker,
                        current: &self.breaker,
                    };
                    (id, update)
                }),
            events: &self.events,
            escalations: &self.escalations,
            gates: &self.gates,
        };
        let committed = self.accessor.persist(&batch);
        debug!(
            committed,
            events = self.events.len(),
            escalations = self.escalations.len(),
            gates = self.gates.len(),
            "session context persisted"
        );
        if !committed {
            self.salvage_audit_trail();
        }

        if self.breaker_dirty
            && let Err(err) = write_breaker_cache(&self.paths.breaker_cache_path, &self.breaker)
        {
            warn!(err = format!("{err:#}"), "breaker cache not written");
        }
        committed
    }
}

/// A merge update for a row this invocation changed.
fn merge<'a, T>(
    dirty: bool,
    loaded: &'a Option<T>,
    current: &'a Option<T>,
) -> Option<RowUpdate<'a, T>> {
    if !dirty {
        return None;
    }
    match (loaded, current) {
        (Some(loaded), Some(current)) => Some(RowUpdate::Merge { loaded, current }),
        _ => None,
    }
}

/// Store record first; the on-disk mirror only when the store is unavailable.
fn load_breaker(
    paths: &StatePaths,
    config: &LoopConfig,
    accessor: &Accessor,
    session: Option<&Session>,
) -> BreakerSnapshot {
    if let Some(snapshot) = session.and_then(|s| accessor.breaker(&s.id)) {
        return snapshot;
    }
    if !accessor.is_available() && paths.breaker_cache_path.exists() {
        match load_breaker_cache(&paths.breaker_cache_path) {
            Ok(snapshot) => return snapshot,
            Err(err) => warn!(err = format!("{err:#}"), "breaker cache unreadable"),
        }
    }
    BreakerSnapshot::new(config.max_failures)
}
