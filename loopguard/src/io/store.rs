//! SQLite-backed persistent state store.
//!
//! Every write binds its values as parameters. The only identifiers ever
//! formatted into SQL are column names from [`SessionField::column`], a closed
//! whitelist.
//!
//! Contention (`SQLITE_BUSY` / `SQLITE_LOCKED`) beyond the connection's busy
//! timeout is retried a bounded number of times with linear backoff.

use std::cmp::Ordering;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use tracing::{debug, instrument, warn};

use super::clock;
use super::config::StoreConfig;
use crate::core::attempt::AttemptState;
use crate::core::breaker::{BreakerSnapshot, BreakerState};
use crate::core::scope::ScopeRules;
use crate::core::types::{
    Checkpoint, CheckpointPayload, Escalation, Event, EventCategory, ExecutionMode, GateResult,
    ModelTier, NewEvent, Session, SessionStatus, Task, TaskStatus,
};

const CURRENT_SCHEMA_VERSION: u32 = 1;

const SESSION_COLUMNS: &str = "id, command, status, phase, model_tier, iteration, max_iterations, \
     consecutive_failures, mode, cost_usd, input_tokens, output_tokens, created_at, updated_at";

const TASK_COLUMNS: &str = "id, session_id, title, status, scope_rules, model_tier, iteration, \
     attempt_state, created_at, updated_at";

const CHECKPOINT_COLUMNS: &str = "id, session_id, task_id, payload, created_at, restorable";

/// Session columns addressable through the typed field accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    Status,
    Phase,
    ModelTier,
    Iteration,
    MaxIterations,
    ConsecutiveFailures,
    Mode,
    CostUsd,
    InputTokens,
    OutputTokens,
}

impl SessionField {
    pub fn column(self) -> &'static str {
        match self {
            SessionField::Status => "status",
            SessionField::Phase => "phase",
            SessionField::ModelTier => "model_tier",
            SessionField::Iteration => "iteration",
            SessionField::MaxIterations => "max_iterations",
            SessionField::ConsecutiveFailures => "consecutive_failures",
            SessionField::Mode => "mode",
            SessionField::CostUsd => "cost_usd",
            SessionField::InputTokens => "input_tokens",
            SessionField::OutputTokens => "output_tokens",
        }
    }

    /// Parse an operator-supplied value for this column.
    pub fn parse_value(self, raw: &str) -> Option<FieldValue> {
        let raw = raw.trim();
        let text = |value: &str| Some(FieldValue::Text(value.to_string()));
        match self {
            SessionField::Status => SessionStatus::parse(raw).and_then(|v| text(v.as_str())),
            SessionField::ModelTier => ModelTier::parse(raw).and_then(|v| text(v.as_str())),
            SessionField::Mode => ExecutionMode::parse(raw).and_then(|v| text(v.as_str())),
            SessionField::Phase => text(raw),
            SessionField::CostUsd => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(FieldValue::Real),
            SessionField::Iteration
            | SessionField::MaxIterations
            | SessionField::ConsecutiveFailures => {
                let count = raw.parse::<u32>().ok();
                count.map(|v| FieldValue::Int(i64::from(v)))
            }
            SessionField::InputTokens | SessionField::OutputTokens => {
                let tokens = raw.parse::<i64>().ok().filter(|v| *v >= 0);
                tokens.map(FieldValue::Int)
            }
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "status" => Some(SessionField::Status),
            "phase" => Some(SessionField::Phase),
            "model_tier" => Some(SessionField::ModelTier),
            "iteration" => Some(SessionField::Iteration),
            "max_iterations" => Some(SessionField::MaxIterations),
            "consecutive_failures" => Some(SessionField::ConsecutiveFailures),
            "mode" => Some(SessionField::Mode),
            "cost_usd" => Some(SessionField::CostUsd),
            "input_tokens" => Some(SessionField::InputTokens),
            "output_tokens" => Some(SessionField::OutputTokens),
            _ => None,
        }
    }
}

/// Loosely typed column value for [`SessionField`] reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Real(f64),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Real(v) => Some(*v as i64),
            FieldValue::Text(v) => v.parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(v) => v.clone(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Real(v) => v.to_string(),
        }
    }
}

/// How a row reaches the store.
#[derive(Debug)]
pub enum RowUpdate<'a, T> {
    /// Write these values as they are.
    Absolute(&'a T),
    /// Re-read the row inside the transaction and fold in only what changed
    /// between `loaded` and `current`. Counters that grew are added to the
    /// stored value; counters that dropped were reset and are written as is.
    Merge { loaded: &'a T, current: &'a T },
}

/// Everything one handler invocation changed, written in a single transaction.
#[derive(Debug, Default)]
pub struct PersistBatch<'a> {
    pub session: Option<RowUpdate<'a, Session>>,
    /// Only the progress columns are written: status, attempt state, tier,
    /// iteration. Scope rules and ownership belong to operator commands.
    pub task: Option<RowUpdate<'a, Task>>,
    pub breaker: Option<(&'a str, RowUpdate<'a, BreakerSnapshot>)>,
    pub events: &'a [NewEvent],
    pub escalations: &'a [Escalation],
    pub gates: &'a [GateResult],
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
}

/// Handle on the state database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    retry: RetryPolicy,
}

impl Store {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path, cfg: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open state database {}", path.display()))?;
        Self::with_connection(conn, cfg)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory state database")?;
        Self::with_connection(conn, &StoreConfig::default())
    }

    fn with_connection(conn: Connection, cfg: &StoreConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
            .context("set busy timeout")?;
        let mut store = Self {
            conn,
            retry: RetryPolicy {
                attempts: cfg.retry_attempts,
                backoff: Duration::from_millis(cfg.retry_backoff_ms),
            },
        };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .context("read schema version")
    }

    fn bootstrap(&mut self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("enable foreign keys")?;
        // Returns the resulting mode as a row; in-memory databases report "memory".
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("set journal mode")?;
        debug!(journal_mode = %mode, "journal mode set");

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("create schema_migrations")?;

        let current = self.schema_version()?;
        if current > CURRENT_SCHEMA_VERSION {
            return Err(anyhow!(
                "state database schema v{current} is newer than supported v{CURRENT_SCHEMA_VERSION}"
            ));
        }
        self.apply_pending_migrations(current)
    }

    fn apply_pending_migrations(&mut self, current: u32) -> Result<()> {
        for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
            let tx = self.conn.transaction().context("begin migration")?;
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, clock::now()],
            )
            .context("record migration")?;
            tx.commit().context("commit migration")?;
            debug!(version, "applied migration");
        }
        Ok(())
    }

    fn retrying<T>(
        &self,
        op: &str,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match f(&self.conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_contention(&err) && attempt < self.retry.attempts => {
                    attempt += 1;
                    warn!(op, attempt, err = %err, "state database busy; retrying");
                    thread::sleep(self.retry.backoff * attempt);
                }
                Err(err) => return Err(err).with_context(|| format!("store {op}")),
            }
        }
    }

    // --- sessions -------------------------------------------------------

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.retrying("insert session", |conn| {
            conn.execute(
                "INSERT INTO sessions (id, command, status, phase, model_tier, iteration, max_iterations,
                    consecutive_failures, mode, cost_usd, input_tokens, output_tokens, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    session.id,
                    session.command,
                    session.status.as_str(),
                    session.phase,
                    session.model_tier.as_str(),
                    session.iteration,
                    session.max_iterations,
                    session.consecutive_failures,
                    session.mode.as_str(),
                    session.cost_usd,
                    to_sql_count(session.input_tokens),
                    to_sql_count(session.output_tokens),
                    session.created_at,
                    session.updated_at,
                ],
            )
        })?;
        debug!(session_id = %session.id, "session inserted");
        Ok(())
    }

    pub fn session(&self, id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        self.retrying("read session", |conn| {
            conn.query_row(&sql, params![id], map_session).optional()
        })
    }

    /// Most recently created session, whatever its status.
    pub fn latest_session(&self) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        self.retrying("read latest session", |conn| {
            conn.query_row(&sql, [], map_session).optional()
        })
    }

    pub fn update_session(&self, session: &Session) -> Result<()> {
        self.retrying("update session", |conn| write_session(conn, session))?;
        Ok(())
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let n = self.retrying("delete session", |conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
        })?;
        Ok(n > 0)
    }

    pub fn session_field(&self, id: &str, field: SessionField) -> Result<Option<FieldValue>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", field.column());
        self.retrying("read session field", |conn| {
            conn.query_row(&sql, params![id], |row| {
                Ok(match row.get_ref(0)? {
                    ValueRef::Integer(v) => FieldValue::Int(v),
                    ValueRef::Real(v) => FieldValue::Real(v),
                    ValueRef::Text(v) => FieldValue::Text(String::from_utf8_lossy(v).into_owned()),
                    ValueRef::Null | ValueRef::Blob(_) => FieldValue::Text(String::new()),
                })
            })
            .optional()
        })
    }

    /// Write one session column. Returns false when the session does not exist.
    pub fn set_session_field(
        &self,
        id: &str,
        field: SessionField,
        value: &FieldValue,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE sessions SET {} = ?1, updated_at = ?2 WHERE id = ?3",
            field.column()
        );
        let now = clock::now();
        let n = self.retrying("write session field", |conn| match value {
            FieldValue::Text(v) => conn.execute(&sql, params![v, now, id]),
            FieldValue::Int(v) => conn.execute(&sql, params![v, now, id]),
            FieldValue::Real(v) => conn.execute(&sql, params![v, now, id]),
        })?;
        Ok(n > 0)
    }

    // --- tasks ----------------------------------------------------------

    /// Insert a task and its dependency edges atomically.
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.retrying("insert task", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO tasks (id, session_id, title, status, scope_rules, model_tier, iteration,
                    attempt_state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.id,
                    task.session_id,
                    task.title,
                    task.status.as_str(),
                    scope_json(&task.scope),
                    task.model_tier.as_str(),
                    task.iteration,
                    task.attempt_state.as_str(),
                    task.created_at,
                    task.updated_at,
                ],
            )?;
            for dep in &task.depends_on {
                tx.execute(
                    "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
                    params![task.id, dep],
                )?;
            }
            tx.commit()
        })?;
        debug!(task_id = %task.id, deps = task.depends_on.len(), "task inserted");
        Ok(())
    }

    pub fn task(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let task = self.retrying("read task", |conn| {
            conn.query_row(&sql, params![id], map_task).optional()
        })?;
        task.map(|t| self.with_dependencies(t)).transpose()
    }

    /// The in-progress task for a session (or for session-less tasks when `None`).
    pub fn active_task(&self, session_id: Option<&str>) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE session_id IS ?1 AND status = 'in_progress'
             ORDER BY updated_at DESC, rowid DESC LIMIT 1"
        );
        let task = self.retrying("read active task", |conn| {
            conn.query_row(&sql, params![session_id], map_task)
                .optional()
        })?;
        task.map(|t| self.with_dependencies(t)).transpose()
    }

    pub fn tasks(&self, session_id: Option<&str>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE session_id IS ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let tasks = self.retrying("list tasks", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![session_id], map_task)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        tasks
            .into_iter()
            .map(|t| self.with_dependencies(t))
            .collect()
    }

    /// Update mutable task columns. Dependencies are fixed at insert time.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        self.retrying("update task", |conn| write_task(conn, task))?;
        Ok(())
    }

    fn with_dependencies(&self, mut task: Task) -> Result<Task> {
        let id = task.id.clone();
        task.depends_on = self.retrying("read task dependencies", |conn| {
            let mut stmt = conn.prepare(
                "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(task)
    }

    // --- events ---------------------------------------------------------

    pub fn append_event(&self, event: &NewEvent) -> Result<i64> {
        let now = clock::now();
        self.retrying("append event", |conn| {
            insert_event(conn, event, &now)?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent events for a session, oldest first.
    pub fn recent_events(&self, session_id: &str, limit: usize) -> Result<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.retrying("read events", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, type, category, message, payload, created_at FROM (
                    SELECT * FROM events WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
                 ) ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session_id, limit], map_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn count_events(&self, session_id: &str, category: Option<EventCategory>) -> Result<u64> {
        let count: i64 = self.retrying("count events", |conn| match category {
            Some(cat) => conn.query_row(
                "SELECT COUNT(*) FROM events WHERE session_id = ?1 AND category = ?2",
                params![session_id, cat.as_str()],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            ),
        })?;
        Ok(from_sql_count(count))
    }

    // --- escalations ----------------------------------------------------

    pub fn record_escalation(&self, escalation: &Escalation) -> Result<i64> {
        self.retrying("record escalation", |conn| {
            insert_escalation(conn, escalation)?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn escalations(&self, session_id: &str) -> Result<Vec<Escalation>> {
        self.retrying("read escalations", |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, task_id, from_tier, to_tier, reason, failure_count, iteration, created_at
                 FROM escalations WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], map_escalation)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    // --- breaker --------------------------------------------------------

    pub fn breaker(&self, session_id: &str) -> Result<Option<BreakerSnapshot>> {
        self.retrying("read breaker", |conn| {
            conn.query_row(
                "SELECT consecutive_failures, threshold, state, last_failure_reason, total_iterations
                 FROM circuit_breakers WHERE session_id = ?1",
                params![session_id],
                map_breaker,
            )
            .optional()
        })
    }

    pub fn save_breaker(&self, session_id: &str, snapshot: &BreakerSnapshot) -> Result<()> {
        let now = clock::now();
        self.retrying("save breaker", |conn| {
            upsert_breaker(conn, session_id, snapshot, &now)
        })?;
        Ok(())
    }

    // --- gates ----------------------------------------------------------

    pub fn record_gate(&self, gate: &GateResult) -> Result<()> {
        let now = clock::now();
        self.retrying("record gate", |conn| insert_gate(conn, gate, &now))?;
        Ok(())
    }

    pub fn gate_results(&self, session_id: &str) -> Result<Vec<GateResult>> {
        self.retrying("read gate results", |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, task_id, gate, passed, iteration
                 FROM gate_results WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok(GateResult {
                    session_id: row.get(0)?,
                    task_id: row.get(1)?,
                    gate: row.get(2)?,
                    passed: row.get(3)?,
                    iteration: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    // --- checkpoints ----------------------------------------------------

    pub fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload =
            serde_json::to_string(&checkpoint.payload).context("serialize checkpoint payload")?;
        self.retrying("insert checkpoint", |conn| {
            conn.execute(
                "INSERT INTO checkpoints (id, session_id, task_id, payload, created_at, restorable)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkpoint.id,
                    checkpoint.session_id,
                    checkpoint.task_id,
                    payload,
                    checkpoint.created_at,
                    checkpoint.restorable,
                ],
            )
        })?;
        Ok(())
    }

    pub fn checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1");
        self.retrying("read checkpoint", |conn| {
            conn.query_row(&sql, params![id], map_checkpoint).optional()
        })
    }

    /// Checkpoints newest first, optionally limited to one session.
    pub fn checkpoints(&self, session_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE ?1 IS NULL OR session_id = ?1 ORDER BY created_at DESC, rowid DESC"
        );
        self.retrying("list checkpoints", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![session_id], map_checkpoint)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    // --- batch ----------------------------------------------------------

    /// Write everything one invocation changed in a single immediate transaction.
    #[instrument(skip_all, fields(
        events = batch.events.len(),
        escalations = batch.escalations.len(),
        gates = batch.gates.len(),
    ))]
    pub fn persist(&self, batch: &PersistBatch<'_>) -> Result<()> {
        let now = clock::now();
        self.retrying("persist", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            if let Some(update) = &batch.session {
                persist_session(&tx, update)?;
            }
            if let Some(update) = &batch.task {
                persist_task(&tx, update)?;
            }
            if let Some((session_id, update)) = &batch.breaker {
                persist_breaker(&tx, session_id, update, &now)?;
            }
            for event in batch.events {
                insert_event(&tx, event, &now)?;
            }
            for escalation in batch.escalations {
                insert_escalation(&tx, escalation)?;
            }
            for gate in batch.gates {
                insert_gate(&tx, gate, &now)?;
            }
            tx.commit()
        })?;
        debug!("invocation state persisted");
        Ok(())
    }
}

fn apply_migration(tx: &Transaction<'_>, version: u32) -> Result<()> {
    match version {
        1 => tx
            .execute_batch(
                "
                CREATE TABLE sessions (
                    id TEXT PRIMARY KEY,
                    command TEXT NOT NULL,
                    status TEXT NOT NULL,
                    phase TEXT NOT NULL DEFAULT '',
                    model_tier TEXT NOT NULL,
                    iteration INTEGER NOT NULL DEFAULT 0,
                    max_iterations INTEGER NOT NULL,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    mode TEXT NOT NULL,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE tasks (
                    id TEXT PRIMARY KEY,
                    session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL,
                    scope_rules TEXT NOT NULL,
                    model_tier TEXT NOT NULL,
                    iteration INTEGER NOT NULL DEFAULT 0,
                    attempt_state TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE task_dependencies (
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    depends_on TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    PRIMARY KEY (task_id, depends_on)
                );

                CREATE TABLE events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT,
                    type TEXT NOT NULL,
                    category TEXT NOT NULL,
                    message TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE escalations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    task_id TEXT,
                    from_tier TEXT NOT NULL,
                    to_tier TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    failure_count INTEGER NOT NULL,
                    iteration INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE circuit_breakers (
                    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                    consecutive_failures INTEGER NOT NULL,
                    threshold INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    last_failure_reason TEXT,
                    total_iterations INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE checkpoints (
                    id TEXT PRIMARY KEY,
                    session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
                    task_id TEXT,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    restorable INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE gate_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
                    task_id TEXT,
                    gate TEXT NOT NULL,
                    passed INTEGER NOT NULL,
                    iteration INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX idx_sessions_created ON sessions(created_at DESC);
                CREATE INDEX idx_tasks_session_status ON tasks(session_id, status);
                CREATE INDEX idx_events_session ON events(session_id, id DESC);
                CREATE INDEX idx_escalations_session ON escalations(session_id);
                CREATE INDEX idx_checkpoints_session ON checkpoints(session_id, created_at DESC);
                CREATE INDEX idx_gate_results_session ON gate_results(session_id);
                ",
            )
            .context("apply migration v1"),
        other => Err(anyhow!("unknown schema migration v{other}")),
    }
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn write_session(conn: &Connection, session: &Session) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE sessions SET status = ?2, phase = ?3, model_tier = ?4, iteration = ?5,
            max_iterations = ?6, consecutive_failures = ?7, mode = ?8, cost_usd = ?9,
            input_tokens = ?10, output_tokens = ?11, updated_at = ?12
         WHERE id = ?1",
        params![
            session.id,
            session.status.as_str(),
            session.phase,
            session.model_tier.as_str(),
            session.iteration,
            session.max_iterations,
            session.consecutive_failures,
            session.mode.as_str(),
            session.cost_usd,
            to_sql_count(session.input_tokens),
            to_sql_count(session.output_tokens),
            session.updated_at,
        ],
    )
}

fn write_task(conn: &Connection, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE tasks SET session_id = ?2, title = ?3, status = ?4, scope_rules = ?5,
            model_tier = ?6, iteration = ?7, attempt_state = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            task.id,
            task.session_id,
            task.title,
            task.status.as_str(),
            scope_json(&task.scope),
            task.model_tier.as_str(),
            task.iteration,
            task.attempt_state.as_str(),
            task.updated_at,
        ],
    )
}

/// Progress columns only; see [`PersistBatch::task`].
fn write_task_progress(conn: &Connection, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE tasks SET status = ?2, model_tier = ?3, iteration = ?4, attempt_state = ?5,
            updated_at = ?6
         WHERE id = ?1",
        params![
            task.id,
            task.status.as_str(),
            task.model_tier.as_str(),
            task.iteration,
            task.attempt_state.as_str(),
            task.updated_at,
        ],
    )
}

fn persist_session(conn: &Connection, update: &RowUpdate<'_, Session>) -> rusqlite::Result<usize> {
    let (loaded, current) = match update {
        RowUpdate::Absolute(session) => return write_session(conn, session),
        RowUpdate::Merge { loaded, current } => (*loaded, *current),
    };
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    let Some(mut row) = conn
        .query_row(&sql, params![current.id], map_session)
        .optional()?
    else {
        return Ok(0);
    };
    merge_value(&mut row.status, &loaded.status, &current.status);
    merge_value(&mut row.model_tier, &loaded.model_tier, &current.model_tier);
    merge_count(&mut row.iteration, loaded.iteration, current.iteration);
    merge_count(
        &mut row.consecutive_failures,
        loaded.consecutive_failures,
        current.consecutive_failures,
    );
    merge_count(
        &mut row.input_tokens,
        loaded.input_tokens,
        current.input_tokens,
    );
    merge_count(
        &mut row.output_tokens,
        loaded.output_tokens,
        current.output_tokens,
    );
    row.cost_usd += current.cost_usd - loaded.cost_usd;
    row.updated_at = current.updated_at.clone();
    write_session(conn, &row)
}

fn persist_task(conn: &Connection, update: &RowUpdate<'_, Task>) -> rusqlite::Result<usize> {
    let (loaded, current) = match update {
        RowUpdate::Absolute(task) => return write_task_progress(conn, task),
        RowUpdate::Merge { loaded, current } => (*loaded, *current),
    };
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let Some(mut row) = conn
        .query_row(&sql, params![current.id], map_task)
        .optional()?
    else {
        return Ok(0);
    };
    merge_value(&mut row.status, &loaded.status, &current.status);
    merge_value(
        &mut row.attempt_state,
        &loaded.attempt_state,
        &current.attempt_state,
    );
    merge_value(&mut row.model_tier, &loaded.model_tier, &current.model_tier);
    merge_count(&mut row.iteration, loaded.iteration, current.iteration);
    row.updated_at = current.updated_at.clone();
    write_task_progress(conn, &row)
}

fn persist_breaker(
    conn: &Connection,
    session_id: &str,
    update: &RowUpdate<'_, BreakerSnapshot>,
    now: &str,
) -> rusqlite::Result<usize> {
    let (loaded, current) = match update {
        RowUpdate::Absolute(snapshot) => return upsert_breaker(conn, session_id, snapshot, now),
        RowUpdate::Merge { loaded, current } => (*loaded, *current),
    };
    let mut row = conn
        .query_row(
            "SELECT consecutive_failures, threshold, state, last_failure_reason, total_iterations
             FROM circuit_breakers WHERE session_id = ?1",
            params![session_id],
            map_breaker,
        )
        .optional()?
        .unwrap_or_else(|| loaded.clone());
    merge_value(&mut row.threshold, &loaded.threshold, &current.threshold);
    merge_value(&mut row.state, &loaded.state, &current.state);
    merge_value(
        &mut row.last_failure_reason,
        &loaded.last_failure_reason,
        &current.last_failure_reason,
    );
    merge_count(
        &mut row.consecutive_failures,
        loaded.consecutive_failures,
        current.consecutive_failures,
    );
    merge_count(
        &mut row.total_iterations,
        loaded.total_iterations,
        current.total_iterations,
    );
    upsert_breaker(conn, session_id, &row, now)
}

/// Take the invocation's value only if the invocation changed it.
fn merge_value<T: PartialEq + Clone>(row: &mut T, loaded: &T, current: &T) {
    if loaded != current {
        *row = current.clone();
    }
}

/// Growth is applied as a delta; a drop is a reset and wins outright.
fn merge_count<T>(row: &mut T, loaded: T, current: T)
where
    T: Copy + Into<u64> + TryFrom<u64>,
{
    let (stored, loaded, current): (u64, u64, u64) = ((*row).into(), loaded.into(), current.into());
    let merged = match current.cmp(&loaded) {
        Ordering::Greater => stored.saturating_add(current - loaded),
        Ordering::Less => current,
        Ordering::Equal => return,
    };
    if let Ok(value) = T::try_from(merged) {
        *row = value;
    }
}

fn insert_event(conn: &Connection, event: &NewEvent, now: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO events (session_id, type, category, message, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.session_id,
            event.kind,
            event.category.as_str(),
            event.message,
            event.payload.to_string(),
            now,
        ],
    )
}

fn insert_escalation(conn: &Connection, escalation: &Escalation) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO escalations (session_id, task_id, from_tier, to_tier, reason, failure_count,
            iteration, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            escalation.session_id,
            escalation.task_id,
            escalation.from_tier.as_str(),
            escalation.to_tier.as_str(),
            escalation.reason,
            escalation.failure_count,
            escalation.iteration,
            escalation.created_at,
        ],
    )
}

fn upsert_breaker(
    conn: &Connection,
    session_id: &str,
    snapshot: &BreakerSnapshot,
    now: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO circuit_breakers (session_id, consecutive_failures, threshold, state,
            last_failure_reason, total_iterations, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(session_id) DO UPDATE SET
            consecutive_failures = excluded.consecutive_failures,
            threshold = excluded.threshold,
            state = excluded.state,
            last_failure_reason = excluded.last_failure_reason,
            total_iterations = excluded.total_iterations,
            updated_at = excluded.updated_at",
        params![
            session_id,
            snapshot.consecutive_failures,
            snapshot.threshold,
            snapshot.state.as_str(),
            snapshot.last_failure_reason,
            snapshot.total_iterations,
            now,
        ],
    )
}

fn insert_gate(conn: &Connection, gate: &GateResult, now: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO gate_results (session_id, task_id, gate, passed, iteration, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            gate.session_id,
            gate.task_id,
            gate.gate,
            gate.passed,
            gate.iteration,
            now,
        ],
    )
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        command: row.get(1)?,
        status: parse_col(row, 2, SessionStatus::parse)?,
        phase: row.get(3)?,
        model_tier: parse_col(row, 4, ModelTier::parse)?,
        iteration: row.get(5)?,
        max_iterations: row.get(6)?,
        consecutive_failures: row.get(7)?,
        mode: parse_col(row, 8, ExecutionMode::parse)?,
        cost_usd: row.get(9)?,
        input_tokens: from_sql_count(row.get(10)?),
        output_tokens: from_sql_count(row.get(11)?),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let scope_raw: String = row.get(4)?;
    let scope: ScopeRules = serde_json::from_str(&scope_raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(err)))?;
    Ok(Task {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        status: parse_col(row, 3, TaskStatus::parse)?,
        scope,
        model_tier: parse_col(row, 5, ModelTier::parse)?,
        iteration: row.get(6)?,
        attempt_state: parse_col(row, 7, AttemptState::parse)?,
        depends_on: Vec::new(),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload_raw: String = row.get(5)?;
    Ok(Event {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: row.get(2)?,
        category: parse_col(row, 3, EventCategory::parse)?,
        message: row.get(4)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        created_at: row.get(6)?,
    })
}

fn map_escalation(row: &Row<'_>) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        session_id: row.get(0)?,
        task_id: row.get(1)?,
        from_tier: parse_col(row, 2, ModelTier::parse)?,
        to_tier: parse_col(row, 3, ModelTier::parse)?,
        reason: row.get(4)?,
        failure_count: row.get(5)?,
        iteration: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_breaker(row: &Row<'_>) -> rusqlite::Result<BreakerSnapshot> {
    Ok(BreakerSnapshot {
        consecutive_failures: row.get(0)?,
        threshold: row.get(1)?,
        state: parse_col(row, 2, BreakerState::parse)?,
        last_failure_reason: row.get(3)?,
        total_iterations: row.get(4)?,
    })
}

fn map_checkpoint(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let payload_raw: String = row.get(3)?;
    let payload: CheckpointPayload = serde_json::from_str(&payload_raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    Ok(Checkpoint {
        id: row.get(0)?,
        session_id: row.get(1)?,
        task_id: row.get(2)?,
        payload,
        created_at: row.get(4)?,
        restorable: row.get(5)?,
    })
}

fn parse_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognised value '{raw}'").into(),
        )
    })
}

fn scope_json(scope: &ScopeRules) -> String {
    serde_json::to_string(scope).unwrap_or_else(|_| "{\"rules\":[]}".to_string())
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scope::ScopeRule;
    use serde_json::json;

    fn session(id: &str) -> Session {
        let now = clock::now();
        Session {
            id: id.to_string(),
            command: "build".to_string(),
            status: SessionStatus::Running,
            phase: "implement".to_string(),
            model_tier: ModelTier::Tier1,
            iteration: 0,
            max_iterations: 20,
            consecutive_failures: 0,
            mode: ExecutionMode::Normal,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn task(id: &str, session_id: Option<&str>, deps: &[&str]) -> Task {
        let now = clock::now();
        Task {
            id: id.to_string(),
            session_id: session_id.map(str::to_string),
            title: format!("{id} title"),
            status: TaskStatus::Pending,
            scope: ScopeRules {
                rules: vec![ScopeRule::Allow("src/**".to_string())],
            },
            model_tier: ModelTier::Tier1,
            iteration: 0,
            attempt_state: AttemptState::Queued,
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn reopening_does_not_reapply_migrations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.db");
        let first = Store::open(&path, &StoreConfig::default()).expect("open");
        let version = first.schema_version().expect("version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        first.insert_session(&session("ses-1")).expect("insert");
        drop(first);

        let second = Store::open(&path, &StoreConfig::default()).expect("reopen");
        let version = second.schema_version().expect("version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(second.session("ses-1").expect("read").is_some());
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.db");
        std::fs::write(&path, b"definitely not a sqlite database").expect("write");
        assert!(Store::open(&path, &StoreConfig::default()).is_err());
    }

    #[test]
    fn latest_session_is_most_recent() {
        let store = Store::in_memory().expect("store");
        let mut older = session("ses-a");
        older.created_at = "2026-01-01T00:00:00.000Z".to_string();
        store.insert_session(&older).expect("insert");
        store.insert_session(&session("ses-b")).expect("insert");
        assert_eq!(
            store.latest_session().expect("read").map(|s| s.id),
            Some("ses-b".to_string())
        );
    }

    #[test]
    fn typed_field_access_round_trips() {
        let store = Store::in_memory().expect("store");
        store.insert_session(&session("ses-1")).expect("insert");

        assert!(
            store
                .set_session_field("ses-1", SessionField::Iteration, &FieldValue::Int(4))
                .expect("write")
        );
        assert_eq!(
            store
                .session_field("ses-1", SessionField::Iteration)
                .expect("read"),
            Some(FieldValue::Int(4))
        );
        assert_eq!(
            store
                .session_field("ses-1", SessionField::Phase)
                .expect("read")
                .map(|v| v.as_text()),
            Some("implement".to_string())
        );
        let phase = FieldValue::Text("x".to_string());
        assert!(
            !store
                .set_session_field("missing", SessionField::Phase, &phase)
                .expect("write")
        );
    }

    #[test]
    fn agent_text_is_bound_not_interpolated() {
        let store = Store::in_memory().expect("store");
        let hostile = "src/x.rs'); DROP TABLE sessions; --";
        store
            .append_event(&NewEvent {
                session_id: Some("ses-1".to_string()),
                kind: "scope_violation".to_string(),
                category: EventCategory::Scope,
                message: hostile.to_string(),
                payload: json!({ "path": hostile }),
            })
            .expect("append");
        store
            .insert_session(&session("ses-1"))
            .expect("sessions table intact");
        let events = store.recent_events("ses-1", 10).expect("events");
        assert_eq!(events[0].message, hostile);
        assert_eq!(events[0].payload["path"], hostile);
    }

    #[test]
    fn tasks_keep_dependencies_and_survive_session_removal() {
        let store = Store::in_memory().expect("store");
        store.insert_session(&session("ses-1")).expect("insert");
        store
            .insert_task(&task("t1", Some("ses-1"), &[]))
            .expect("t1");
        store
            .insert_task(&task("t2", Some("ses-1"), &["t1"]))
            .expect("t2");

        let loaded = store.task("t2").expect("read").expect("present");
        assert_eq!(loaded.depends_on, vec!["t1".to_string()]);
        assert_eq!(loaded.scope.allow_patterns(), vec!["src/**".to_string()]);

        assert!(store.delete_session("ses-1").expect("delete"));
        let orphan = store.task("t2").expect("read").expect("still present");
        assert_eq!(orphan.session_id, None);
    }

    #[test]
    fn unknown_dependency_is_rejected_atomically() {
        let store = Store::in_memory().expect("store");
        assert!(store.insert_task(&task("t1", None, &["nope"])).is_err());
        assert!(store.task("t1").expect("read").is_none());
    }

    #[test]
    fn active_task_is_the_in_progress_one() {
        let store = Store::in_memory().expect("store");
        store.insert_session(&session("ses-1")).expect("insert");
        store
            .insert_task(&task("t1", Some("ses-1"), &[]))
            .expect("t1");
        assert!(store.active_task(Some("ses-1")).expect("read").is_none());

        let mut running = store.task("t1").expect("read").expect("present");
        running.status = TaskStatus::InProgress;
        running.attempt_state = AttemptState::Running;
        store.update_task(&running).expect("update");

        let active = store
            .active_task(Some("ses-1"))
            .expect("read")
            .expect("active");
        assert_eq!(active.id, "t1");
        assert_eq!(active.attempt_state, AttemptState::Running);
    }

    #[test]
    fn breaker_upsert_overwrites() {
        let store = Store::in_memory().expect("store");
        store.insert_session(&session("ses-1")).expect("insert");
        let mut snapshot = BreakerSnapshot::new(5);
        store.save_breaker("ses-1", &snapshot).expect("save");
        snapshot.consecutive_failures = 5;
        snapshot.state = BreakerState::Open;
        store.save_breaker("ses-1", &snapshot).expect("save again");
        assert_eq!(store.breaker("ses-1").expect("read"), Some(snapshot));
    }

    #[test]
    fn persist_writes_everything_or_nothing() {
        let store = Store::in_memory().expect("store");
        let mut s = session("ses-1");
        store.insert_session(&s).expect("insert");
        s.iteration = 3;

        let events = vec![NewEvent {
            session_id: Some("ses-1".to_string()),
            kind: "exit_blocked".to_string(),
            category: EventCategory::Exit,
            message: "blocked".to_string(),
            payload: json!({}),
        }];
        // Escalation for a session that does not exist violates the foreign key.
        let bad = vec![Escalation {
            session_id: "ghost".to_string(),
            task_id: None,
            from_tier: ModelTier::Tier1,
            to_tier: ModelTier::Tier2,
            reason: "x".to_string(),
            failure_count: 2,
            iteration: 0,
            created_at: clock::now(),
        }];
        let err = store.persist(&PersistBatch {
            session: Some(RowUpdate::Absolute(&s)),
            events: &events,
            escalations: &bad,
            ..PersistBatch::default()
        });
        assert!(err.is_err());
        assert_eq!(
            store.session("ses-1").expect("read").expect("s").iteration,
            0
        );
        assert_eq!(store.count_events("ses-1", None).expect("count"), 0);

        store
            .persist(&PersistBatch {
                session: Some(RowUpdate::Absolute(&s)),
                events: &events,
                ..PersistBatch::default()
            })
            .expect("persist");
        assert_eq!(
            store.session("ses-1").expect("read").expect("s").iteration,
            3
        );
        assert_eq!(
            store
                .count_events("ses-1", Some(EventCategory::Exit))
                .expect("count"),
            1
        );
    }

    #[test]
    fn overlapping_merges_add_their_increments() {
        let store = Store::in_memory().expect("store");
        let loaded = session("ses-1");
        store.insert_session(&loaded).expect("insert");
        let mut bumped = loaded.clone();
        bumped.iteration += 1;
        bumped.input_tokens += 100;

        for _ in 0..2 {
            store
                .persist(&PersistBatch {
                    session: Some(RowUpdate::Merge {
                        loaded: &loaded,
                        current: &bumped,
                    }),
                    ..PersistBatch::default()
                })
                .expect("persist");
        }
        let stored = store.session("ses-1").expect("read").expect("session");
        assert_eq!(stored.iteration, 2);
        assert_eq!(stored.input_tokens, 200);
        assert_eq!(stored.status, SessionStatus::Running);
    }

    #[test]
    fn merge_keeps_columns_the_invocation_did_not_change() {
        let store = Store::in_memory().expect("store");
        let mut loaded = session("ses-1");
        loaded.consecutive_failures = 1;
        store.insert_session(&loaded).expect("insert");
        let loaded_task = task("t1", Some("ses-1"), &[]);
        store.insert_task(&loaded_task).expect("task");

        // Operator changes made while the invocation was running.
        let mut operator = loaded.clone();
        operator.max_iterations = 40;
        operator.consecutive_failures = 3;
        store.update_session(&operator).expect("operator session");
        let mut rescoped = loaded_task.clone();
        rescoped.scope = ScopeRules::parse("+src/**\n!src/secrets\n").expect("rules");
        store.update_task(&rescoped).expect("operator scope");

        let mut reset = loaded.clone();
        reset.consecutive_failures = 0;
        reset.model_tier = ModelTier::Tier2;
        let mut progressed = loaded_task.clone();
        progressed.attempt_state = AttemptState::GateFailed;
        progressed.iteration = 1;
        store
            .persist(&PersistBatch {
                session: Some(RowUpdate::Merge {
                    loaded: &loaded,
                    current: &reset,
                }),
                task: Some(RowUpdate::Merge {
                    loaded: &loaded_task,
                    current: &progressed,
                }),
                ..PersistBatch::default()
            })
            .expect("persist");

        let stored = store.session("ses-1").expect("read").expect("session");
        assert_eq!(stored.max_iterations, 40);
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.model_tier, ModelTier::Tier2);
        let stored_task = store.task("t1").expect("read").expect("task");
        assert_eq!(stored_task.scope, rescoped.scope);
        assert_eq!(stored_task.attempt_state, AttemptState::GateFailed);
        assert_eq!(stored_task.iteration, 1);
    }

    #[test]
    fn breaker_merge_applies_deltas_and_creates_missing_rows() {
        let store = Store::in_memory().expect("store");
        store.insert_session(&session("ses-1")).expect("insert");
        let loaded = BreakerSnapshot::new(5);
        let mut failed = loaded.clone();
        failed.consecutive_failures = 1;
        failed.total_iterations = 1;
        failed.last_failure_reason = Some("tests failed".to_string());

        for _ in 0..2 {
            store
                .persist(&PersistBatch {
                    breaker: Some((
                        "ses-1",
                        RowUpdate::Merge {
                            loaded: &loaded,
                            current: &failed,
                        },
                    )),
                    ..PersistBatch::default()
                })
                .expect("persist");
        }
        let stored = store.breaker("ses-1").expect("read").expect("breaker");
        assert_eq!(stored.consecutive_failures, 2);
        assert_eq!(stored.total_iterations, 2);
        assert_eq!(stored.state, BreakerState::Closed);
        assert_eq!(stored.last_failure_reason.as_deref(), Some("tests failed"));
    }

    #[test]
    fn escalations_and_gates_are_listed_in_order() {
        let store = Store::in_memory().expect("store");
        store.insert_session(&session("ses-1")).expect("insert");
        for (from, to) in [
            (ModelTier::Tier1, ModelTier::Tier2),
            (ModelTier::Tier2, ModelTier::Tier3),
        ] {
            store
                .record_escalation(&Escalation {
                    session_id: "ses-1".to_string(),
                    task_id: None,
                    from_tier: from,
                    to_tier: to,
                    reason: "gate failures".to_string(),
                    failure_count: 2,
                    iteration: 1,
                    created_at: clock::now(),
                })
                .expect("record");
        }
        store
            .record_gate(&GateResult {
                session_id: Some("ses-1".to_string()),
                task_id: None,
                gate: "tests".to_string(),
                passed: false,
                iteration: 1,
            })
            .expect("gate");

        let rows = store.escalations("ses-1").expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].to_tier, ModelTier::Tier3);
        assert_eq!(store.gate_results("ses-1").expect("gates").len(), 1);
    }
}
