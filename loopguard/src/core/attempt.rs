//! Task-attempt state machine.
//!
//! ```text
//! queued -> running -> gate_failed -> running          (iterate)
//!                   -> gate_failed xN -> escalated -> running
//!                   -> escalated xM -> needs_diagnosis -> running
//!                   -> gate_passed -> completed
//! ```
//!
//! Terminal states: `completed`, `aborted` (breaker open), `handoff` (iteration
//! ceiling or exhausted escalation).

use serde::{Deserialize, Serialize};

use crate::core::types::ModelTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    #[default]
    Queued,
    Running,
    GateFailed,
    GatePassed,
    Escalated,
    NeedsDiagnosis,
    Completed,
    Aborted,
    Handoff,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Queued => "queued",
            AttemptState::Running => "running",
            AttemptState::GateFailed => "gate_failed",
            AttemptState::GatePassed => "gate_passed",
            AttemptState::Escalated => "escalated",
            AttemptState::NeedsDiagnosis => "needs_diagnosis",
            AttemptState::Completed => "completed",
            AttemptState::Aborted => "aborted",
            AttemptState::Handoff => "handoff",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(AttemptState::Queued),
            "running" => Some(AttemptState::Running),
            "gate_failed" => Some(AttemptState::GateFailed),
            "gate_passed" => Some(AttemptState::GatePassed),
            "escalated" => Some(AttemptState::Escalated),
            "needs_diagnosis" => Some(AttemptState::NeedsDiagnosis),
            "completed" => Some(AttemptState::Completed),
            "aborted" => Some(AttemptState::Aborted),
            "handoff" => Some(AttemptState::Handoff),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Completed | AttemptState::Aborted | AttemptState::Handoff
        )
    }

    /// States from which the next action implicitly resumes `running`.
    fn is_resting(self) -> bool {
        matches!(
            self,
            AttemptState::GateFailed
                | AttemptState::GatePassed
                | AttemptState::Escalated
                | AttemptState::NeedsDiagnosis
        )
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Start,
    GateFailed,
    GatePassed,
    Escalated { to: ModelTier },
    Complete,
    BreakerOpen,
    Handoff,
}

/// Apply `event` to `state`, returning the next state or a stable error message.
pub fn transition(state: AttemptState, event: AttemptEvent) -> Result<AttemptState, String> {
    use AttemptState as S;

    if state.is_terminal() {
        return Err(format!(
            "attempt is {} (terminal); cannot apply {:?}",
            state.as_str(),
            event
        ));
    }

    let next = match (state, event) {
        (_, AttemptEvent::BreakerOpen) => S::Aborted,
        (_, AttemptEvent::Handoff) => S::Handoff,
        (S::Queued, AttemptEvent::Start) => S::Running,
        (s, AttemptEvent::Start) if s == S::Running || s.is_resting() => S::Running,
        (S::Running | S::GateFailed, AttemptEvent::GateFailed) => S::GateFailed,
        (S::Running | S::GateFailed, AttemptEvent::Escalated { to }) => {
            if to == ModelTier::Diagnostic {
                S::NeedsDiagnosis
            } else {
                S::Escalated
            }
        }
        (S::Running | S::GateFailed | S::GatePassed, AttemptEvent::GatePassed) => S::GatePassed,
        (S::Running | S::GatePassed, AttemptEvent::Complete) => S::Completed,
        (s, e) => {
            return Err(format!("invalid attempt transition from {} on {:?}", s.as_str(), e));
        }
    };
    Ok(next)
}

/// Like [`transition`], but resumes `running` first when the attempt is resting.
///
/// Gate results arrive on the next action after an escalation, which implicitly
/// restarts the attempt.
pub fn advance(state: AttemptState, event: AttemptEvent) -> Result<AttemptState, String> {
    use AttemptState as S;
    let needs_resume = match event {
        AttemptEvent::GateFailed | AttemptEvent::Escalated { .. } => {
            matches!(state, S::Escalated | S::NeedsDiagnosis | S::GatePassed)
        }
        AttemptEvent::GatePassed => matches!(state, S::Escalated | S::NeedsDiagnosis),
        _ => false,
    };
    let current = if needs_resume {
        transition(state, AttemptEvent::Start)?
    } else {
        state
    };
    transition(current, event)
}
