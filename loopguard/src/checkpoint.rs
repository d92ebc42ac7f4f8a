//! Checkpoint save, list, and restore.
//!
//! Each checkpoint is written three ways: an artifact file under
//! `.loopguard/checkpoints/`, an entry in `checkpoints/index.json`, and a store
//! row. All three are advisory; losing any of them only costs recovery
//! convenience. Restore applies absolute values, so repeating it is a no-op.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Checkpoint, CheckpointPayload};
use crate::io::accessor::Accessor;
use crate::io::breaker_cache::write_breaker_cache;
use crate::io::clock;
use crate::io::init::StatePaths;
use crate::io::marker::set_autonomous;
use crate::io::store::{PersistBatch, RowUpdate};

/// One line of `checkpoints/index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub reason: String,
    pub created_at: String,
}

pub struct CheckpointManager<'a> {
    paths: &'a StatePaths,
    accessor: &'a Accessor,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(paths: &'a StatePaths, accessor: &'a Accessor) -> Self {
        Self { paths, accessor }
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.paths.checkpoints_dir.join(format!("{id}.json"))
    }

    /// Capture `payload` and return the stored checkpoint.
    #[instrument(skip_all, fields(reason = %payload.reason))]
    pub fn save(&self, payload: CheckpointPayload) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            id: clock::new_id("cp"),
            session_id: payload.session_id.clone(),
            task_id: payload.task_id.clone(),
            payload,
            created_at: clock::now(),
            restorable: true,
        };

        let mut buf = serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?;
        buf.push('\n');
        crate::io::write_atomic(&self.artifact_path(&checkpoint.id), &buf)?;

        let mut index = self.read_index();
        index.push(IndexEntry {
            id: checkpoint.id.clone(),
            session_id: checkpoint.session_id.clone(),
            task_id: checkpoint.task_id.clone(),
            reason: checkpoint.payload.reason.clone(),
            created_at: checkpoint.created_at.clone(),
        });
        self.write_index(&index)?;

        if let Some(store) = self.accessor.store()
            && let Err(err) = store.insert_checkpoint(&checkpoint)
        {
            warn!(err = format!("{err:#}"), id = %checkpoint.id, "checkpoint row not stored");
        }
        info!(id = %checkpoint.id, "checkpoint saved");
        Ok(checkpoint)
    }

    /// Every known checkpoint, newest first. Store rows and artifact files are
    /// merged so a rebuilt store still lists older checkpoints.
    pub fn list(&self) -> Vec<Checkpoint> {
        let mut by_id: BTreeMap<String, Checkpoint> = BTreeMap::new();
        if let Some(store) = self.accessor.store() {
            match store.checkpoints(None) {
                Ok(rows) => {
                    for row in rows {
                        by_id.insert(row.id.clone(), row);
                    }
                }
                Err(err) => warn!(err = format!("{err:#}"), "checkpoint rows unreadable"),
            }
        }
        for entry in self.read_index() {
            if by_id.contains_key(&entry.id) {
                continue;
            }
            match self.read_artifact(&entry.id) {
                Ok(checkpoint) => {
                    by_id.insert(entry.id, checkpoint);
                }
                Err(err) => {
                    debug!(id = %entry.id, err = format!("{err:#}"), "checkpoint artifact missing")
                }
            }
        }
        let mut all: Vec<Checkpoint> = by_id.into_values().collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        all
    }

    /// Look a checkpoint up in the store, then on disk.
    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        if let Some(store) = self.accessor.store() {
            match store.checkpoint(id) {
                Ok(Some(checkpoint)) => return Ok(checkpoint),
                Ok(None) => {}
                Err(err) => warn!(err = format!("{err:#}"), id, "checkpoint row unreadable"),
            }
        }
        self.read_artifact(id)
            .with_context(|| format!("checkpoint {id} not found"))
    }

    /// Rehydrate session, task, breaker, and autonomous flag from `id`.
    #[instrument(skip_all, fields(id = %id))]
    pub fn restore(&self, id: &str) -> Result<Checkpoint> {
        let checkpoint = self.load(id)?;
        if !checkpoint.restorable {
            bail!("checkpoint {id} is not restorable");
        }
        let payload = &checkpoint.payload;

        if let Some(session_id) = payload.session_id.as_deref() {
            let store = self
                .accessor
                .store()
                .context("state store unavailable; cannot restore session state")?;
            let mut session = store
                .session(session_id)?
                .ok_or_else(|| anyhow!("session {session_id} of checkpoint {id} is gone"))?;
            if let Some(status) = payload.session_status {
                session.status = status;
            }
            session.model_tier = payload.model_tier;
            session.iteration = payload.iteration;
            session.consecutive_failures = payload.consecutive_failures;
            session.updated_at = clock::now();

            let task = match payload.task_id.as_deref() {
                Some(task_id) => store.task(task_id)?.map(|mut task| {
                    if let Some(status) = payload.task_status {
                        task.status = status;
                    }
                    if let Some(state) = payload.attempt_state {
                        task.attempt_state = state;
                    }
                    task.model_tier = payload.model_tier;
                    task.iteration = payload.task_iteration;
                    task.updated_at = session.updated_at.clone();
                    task
                }),
                None => None,
            };

            store.persist(&PersistBatch {
                session: Some(RowUpdate::Absolute(&session)),
                task: task.as_ref().map(RowUpdate::Absolute),
                breaker: Some((session_id, RowUpdate::Absolute(&payload.breaker))),
                ..PersistBatch::default()
            })?;
        }

        write_breaker_cache(&self.paths.breaker_cache_path, &payload.breaker)?;
        set_autonomous(&self.paths.autonomous_marker_path, payload.autonomous)?;
        info!(
            session_id = ?payload.session_id,
            iteration = payload.iteration,
            tier = payload.model_tier.as_str(),
            "checkpoint restored"
        );
        Ok(checkpoint)
    }

    fn read_artifact(&self, id: &str) -> Result<Checkpoint> {
        if id.contains(['/', '\\']) || id.starts_with('.') {
            bail!("invalid checkpoint id {id:?}");
        }
        let path = self.artifact_path(id);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// A missing or corrupt index reads as empty; the store still has the rows.
    fn read_index(&self) -> Vec<IndexEntry> {
        let path = &self.paths.checkpoint_index_path;
        let Ok(contents) = fs::read_to_string(path) else {
            return Vec::new();
        };
        serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(
                path = %path.display(),
                err = %err,
                "checkpoint index corrupt; starting a new one"
            );
            Vec::new()
        })
    }

    fn write_index(&self, index: &[IndexEntry]) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(index).context("serialize checkpoint index")?;
        buf.push('\n');
        crate::io::write_atomic(&self.paths.checkpoint_index_path, &buf)
    }
}
