//! Circuit breaker and model-tier escalation policy.
//!
//! Two counters are tracked:
//!
//! - the escalation counter on the [`Ladder`], zeroed on success and on every
//!   promotion;
//! - the breaker counter on the [`BreakerSnapshot`], zeroed only on success or
//!   an explicit reset. Reaching `max_failures` trips the breaker open once.
//!
//! An open breaker is frozen until an operator resets it.

use serde::{Deserialize, Serialize};

use crate::core::types::{ExecutionMode, ModelTier};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            _ => None,
        }
    }
}

/// Session-wide breaker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub consecutive_failures: u32,
    /// Hard ceiling (`max_failures`).
    pub threshold: u32,
    pub state: BreakerState,
    pub last_failure_reason: Option<String>,
    pub total_iterations: u32,
}

impl BreakerSnapshot {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold,
            state: BreakerState::Closed,
            last_failure_reason: None,
            total_iterations: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    /// Operator reset: close the breaker and clear the counter.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.last_failure_reason = None;
    }
}

/// Escalation position for the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ladder {
    pub tier: ModelTier,
    pub consecutive_failures: u32,
}

/// Thresholds driving escalation and the hard trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub normal_threshold: u32,
    pub eco_threshold: u32,
    pub max_failures: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            normal_threshold: 2,
            eco_threshold: 4,
            max_failures: 5,
        }
    }
}

impl BreakerPolicy {
    pub fn escalation_threshold(&self, mode: ExecutionMode) -> u32 {
        match mode {
            ExecutionMode::Normal => self.normal_threshold,
            ExecutionMode::Eco => self.eco_threshold,
        }
    }
}

/// Outcome fed into the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure { reason: String },
}

/// A single tier promotion decided by [`apply_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub from: ModelTier,
    pub to: ModelTier,
    /// Escalation counter value that triggered the promotion.
    pub failure_count: u32,
}

/// What changed as a result of one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakerUpdate {
    pub promotion: Option<Promotion>,
    /// Threshold reached while already at the diagnostic tier.
    pub ladder_exhausted: bool,
    /// The breaker flipped from closed to open on this outcome.
    pub tripped: bool,
    /// The breaker was already open; nothing changed.
    pub frozen: bool,
}

/// Apply one attempt outcome to the ladder and breaker.
pub fn apply_outcome(
    ladder: &mut Ladder,
    breaker: &mut BreakerSnapshot,
    outcome: &AttemptOutcome,
    mode: ExecutionMode,
    policy: &BreakerPolicy,
) -> BreakerUpdate {
    if breaker.is_open() {
        return BreakerUpdate {
            frozen: true,
            ..BreakerUpdate::default()
        };
    }

    let reason = match outcome {
        AttemptOutcome::Success => {
            // No demotion: the tier stays elevated until the task completes.
            ladder.consecutive_failures = 0;
            breaker.consecutive_failures = 0;
            return BreakerUpdate::default();
        }
        AttemptOutcome::Failure { reason } => reason,
    };

    let mut update = BreakerUpdate::default();

    breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
    breaker.last_failure_reason = Some(reason.clone());
    if breaker.consecutive_failures >= breaker.threshold {
        breaker.state = BreakerState::Open;
        update.tripped = true;
    }

    ladder.consecutive_failures = ladder.consecutive_failures.saturating_add(1);
    if ladder.consecutive_failures >= policy.escalation_threshold(mode) {
        match ladder.tier.promote() {
            Some(next) => {
                update.promotion = Some(Promotion {
                    from: ladder.tier,
                    to: next,
                    failure_count: ladder.consecutive_failures,
                });
                ladder.tier = next;
                ladder.consecutive_failures = 0;
            }
            None => update.ladder_exhausted = true,
        }
    }

    update
}
