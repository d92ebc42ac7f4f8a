//! Shared deterministic types for the control loop.
//!
//! These types define stable contracts between core components and the store.
//! String forms (`as_str` / `parse`) are the persisted representation and must
//! not change without a schema migration.

use serde::{Deserialize, Serialize};

use crate::core::attempt::AttemptState;
use crate::core::breaker::BreakerSnapshot;
use crate::core::scope::ScopeRules;

/// Lifecycle status of an autonomous session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initializing" => Some(SessionStatus::Initializing),
            "running" => Some(SessionStatus::Running),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "aborted" => Some(SessionStatus::Aborted),
            _ => None,
        }
    }

    /// Terminal sessions are never mutated by the dispatcher again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Aborted
        )
    }
}

/// Status of a unit of work inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }
}

/// Execution mode. Eco mode tolerates more failures before escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    Eco,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Normal => "normal",
            ExecutionMode::Eco => "eco",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "normal" => Some(ExecutionMode::Normal),
            "eco" => Some(ExecutionMode::Eco),
            _ => None,
        }
    }
}

/// Capability level assigned to the current attempt.
///
/// Ordered: `Tier1 < Tier2 < Tier3 < Diagnostic`. `Diagnostic` is terminal and
/// requires multi-perspective review before further automated attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Tier1,
    Tier2,
    Tier3,
    Diagnostic,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Tier1 => "tier1",
            ModelTier::Tier2 => "tier2",
            ModelTier::Tier3 => "tier3",
            ModelTier::Diagnostic => "diagnostic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tier1" => Some(ModelTier::Tier1),
            "tier2" => Some(ModelTier::Tier2),
            "tier3" => Some(ModelTier::Tier3),
            "diagnostic" => Some(ModelTier::Diagnostic),
            _ => None,
        }
    }

    /// Next rung on the ladder, or `None` at the top.
    pub fn promote(self) -> Option<Self> {
        match self {
            ModelTier::Tier1 => Some(ModelTier::Tier2),
            ModelTier::Tier2 => Some(ModelTier::Tier3),
            ModelTier::Tier3 => Some(ModelTier::Diagnostic),
            ModelTier::Diagnostic => None,
        }
    }
}

/// Lifecycle event types the dispatcher is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    BeforeAction,
    AfterAction,
    AtExit,
    PreTruncation,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::BeforeAction => "before-action",
            HookEvent::AfterAction => "after-action",
            HookEvent::AtExit => "at-exit",
            HookEvent::PreTruncation => "pre-truncation",
        }
    }
}

/// Coarse classification of an action's textual result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    Unknown,
}

/// Audit-trail grouping for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Scope,
    Safety,
    Gate,
    Escalation,
    Breaker,
    Exit,
    Checkpoint,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Lifecycle => "lifecycle",
            EventCategory::Scope => "scope",
            EventCategory::Safety => "safety",
            EventCategory::Gate => "gate",
            EventCategory::Escalation => "escalation",
            EventCategory::Breaker => "breaker",
            EventCategory::Exit => "exit",
            EventCategory::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "lifecycle" => Some(EventCategory::Lifecycle),
            "scope" => Some(EventCategory::Scope),
            "safety" => Some(EventCategory::Safety),
            "gate" => Some(EventCategory::Gate),
            "escalation" => Some(EventCategory::Escalation),
            "breaker" => Some(EventCategory::Breaker),
            "exit" => Some(EventCategory::Exit),
            "checkpoint" => Some(EventCategory::Checkpoint),
            _ => None,
        }
    }
}

/// One end-to-end autonomous run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub command: String,
    pub status: SessionStatus,
    pub phase: String,
    pub model_tier: ModelTier,
    /// Exit attempts blocked so far. Monotonic except on explicit restore.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Escalation counter: zeroed on success and on every promotion.
    pub consecutive_failures: u32,
    pub mode: ExecutionMode,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// A unit of work within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Owning session; cleared if the session row is removed.
    pub session_id: Option<String>,
    pub title: String,
    pub status: TaskStatus,
    pub scope: ScopeRules,
    pub model_tier: ModelTier,
    pub iteration: u32,
    pub attempt_state: AttemptState,
    pub depends_on: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Event to append to the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewEvent {
    pub session_id: Option<String>,
    pub kind: String,
    pub category: EventCategory,
    pub message: String,
    pub payload: serde_json::Value,
}

/// Persisted, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: i64,
    pub session_id: Option<String>,
    pub kind: String,
    pub category: EventCategory,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// One model-tier promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub session_id: String,
    pub task_id: Option<String>,
    pub from_tier: ModelTier,
    pub to_tier: ModelTier,
    pub reason: String,
    pub failure_count: u32,
    pub iteration: u32,
    pub created_at: String,
}

/// Per-gate pass/fail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub gate: String,
    pub passed: bool,
    pub iteration: u32,
}

/// Snapshot captured by a checkpoint. Restoring applies these values verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub session_status: Option<SessionStatus>,
    pub task_status: Option<TaskStatus>,
    pub attempt_state: Option<AttemptState>,
    pub model_tier: ModelTier,
    pub iteration: u32,
    /// Gate attempts on the task. Absent from older checkpoints.
    #[serde(default)]
    pub task_iteration: u32,
    pub consecutive_failures: u32,
    pub breaker: BreakerSnapshot,
    pub autonomous: bool,
    pub reason: String,
}

/// Durable, restorable snapshot of execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub payload: CheckpointPayload,
    pub created_at: String,
    pub restorable: bool,
}
