//! Fail-open façade over the store.
//!
//! Each call is one short, independently committed operation. Any storage
//! failure is logged and degrades to an empty or zero result; nothing here can
//! make a hook block or crash.

use anyhow::Result;
use tracing::{debug, warn};

use super::config::StoreConfig;
use super::init::StatePaths;
use super::store::{FieldValue, PersistBatch, SessionField, Store};
use crate::core::breaker::BreakerSnapshot;
use crate::core::types::{Escalation, NewEvent, Session, Task};

pub struct Accessor {
    store: Option<Store>,
}

impl Accessor {
    /// Open the project's store. An uninitialized project or a broken database
    /// yields an accessor that answers every read with nothing.
    pub fn open(paths: &StatePaths, cfg: &StoreConfig) -> Self {
        if !paths.is_initialized() {
            debug!(root = %paths.root.display(), "no state directory; running without a store");
            return Self::unavailable();
        }
        match Store::open(&paths.db_path, cfg) {
            Ok(store) => Self::from_store(store),
            Err(err) => {
                warn!(
                    err = format!("{err:#}"),
                    "state store unavailable; treating as no prior state"
                );
                Self::unavailable()
            }
        }
    }

    pub fn from_store(store: Store) -> Self {
        Self { store: Some(store) }
    }

    pub fn unavailable() -> Self {
        Self { store: None }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    fn absorb<T>(&self, op: &str, f: impl FnOnce(&Store) -> Result<T>) -> Option<T> {
        let store = self.store.as_ref()?;
        match f(store) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    op,
                    err = format!("{err:#}"),
                    "state store call failed; continuing without it"
                );
                None
            }
        }
    }

    /// The most recent session, in any status.
    pub fn current_session(&self) -> Option<Session> {
        self.absorb("current session", Store::latest_session)
            .flatten()
    }

    /// The in-progress task of `session_id`.
    pub fn current_task(&self, session_id: Option<&str>) -> Option<Task> {
        self.absorb("current task", |s| s.active_task(session_id))
            .flatten()
    }

    pub fn session_field(&self, session_id: &str, field: SessionField) -> Option<FieldValue> {
        self.absorb("session field", |s| s.session_field(session_id, field))
            .flatten()
    }

    /// Returns false when the session is missing or the write failed.
    pub fn set_session_field(
        &self,
        session_id: &str,
        field: SessionField,
        value: &FieldValue,
    ) -> bool {
        self.absorb("set session field", |s| {
            s.set_session_field(session_id, field, value)
        })
        .unwrap_or(false)
    }

    pub fn append_event(&self, event: &NewEvent) -> Option<i64> {
        self.absorb("append event", |s| s.append_event(event))
    }

    pub fn record_escalation(&self, escalation: &Escalation) -> Option<i64> {
        self.absorb("record escalation", |s| s.record_escalation(escalation))
    }

    pub fn breaker(&self, session_id: &str) -> Option<BreakerSnapshot> {
        self.absorb("breaker", |s| s.breaker(session_id)).flatten()
    }

    /// Returns whether the batch was committed.
    pub fn persist(&self, batch: &PersistBatch<'_>) -> bool {
        self.absorb("persist", |s| s.persist(batch)).is_some()
    }

    /// Direct store access for operator commands, which must surface errors.
    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }
}
