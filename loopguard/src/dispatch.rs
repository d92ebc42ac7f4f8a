//! Control-loop dispatcher.
//!
//! One entry point per lifecycle event. Each handler reads the loaded
//! [`SessionContext`], decides allow/block, and queues the state changes; the
//! caller persists the context once afterwards.
//!
//! Order of checks in `before-action`:
//! 1. destructive command signatures (unconditional)
//! 2. operator-only commands and writes into `.loopguard/`
//! 3. halted loop (breaker open, handoff, iteration ceiling) in autonomous mode
//! 4. commit-time scope check against staged files
//! 5. edit-time scope check on write-like operations
//! 6. ceiling warnings

use anyhow::Result;
use minijinja::context;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::CheckpointManager;
use crate::core::abandonment::{Category, Classifier, ClassifyContext, PatternClassifier};
use crate::core::attempt::{AttemptEvent, AttemptState, advance};
use crate::core::breaker::{AttemptOutcome, Ladder, apply_outcome};
use crate::core::commands::{is_git_commit, is_within, operator_invocation, protected_write};
use crate::core::danger::{DangerContext, check_command};
use crate::core::outcome::{classify_result, detect_gates};
use crate::core::scope::{ScopeVerdict, ScopeViolation, relativize};
use crate::core::types::{
    ActionOutcome, Escalation, EventCategory, GateResult, HookEvent, ModelTier, SessionStatus,
};
use crate::exit_codes;
use crate::io::clock;
use crate::io::config::EditCheck;
use crate::io::context::{ResumeNote, write_resume_note};
use crate::io::git::{GitRepo, RepoState};
use crate::io::guidance::{Guidance, GuidanceEngine};
use crate::io::hook_input::HookInput;
use crate::io::init::{STATE_DIR, StatePaths};
use crate::session_context::SessionContext;

/// Binary name matched when spotting operator commands issued by the agent.
const OPERATOR_PROGRAM: &str = "loopguard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Block,
}

/// Why a hook blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ScopeViolation,
    DangerousOperation,
    /// Agent tried to change loop control state or run an operator command.
    ProtectedState,
    GateFailure,
    CircuitOpen,
    /// Tier promotion or exhausted ladder (handoff).
    Escalation,
    ExitWithoutCompletion,
    IterationCeiling,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::ScopeViolation => "scope_violation",
            BlockReason::DangerousOperation => "dangerous_operation",
            BlockReason::ProtectedState => "protected_state",
            BlockReason::GateFailure => "gate_failure",
            BlockReason::CircuitOpen => "circuit_open",
            BlockReason::Escalation => "escalation",
            BlockReason::ExitWithoutCompletion => "exit_without_completion",
            BlockReason::IterationCeiling => "iteration_ceiling",
        }
    }
}

/// Decision returned to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookResponse {
    pub decision: Decision,
    pub reason: Option<BlockReason>,
    /// Text shown to the agent before its next action.
    pub guidance: Option<String>,
}

impl HookResponse {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            guidance: None,
        }
    }

    /// Allow, with a warning for the agent.
    pub fn advise(guidance: String) -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            guidance: Some(guidance),
        }
    }

    pub fn block(reason: BlockReason, guidance: String) -> Self {
        Self {
            decision: Decision::Block,
            reason: Some(reason),
            guidance: Some(guidance),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.decision == Decision::Block
    }

    pub fn exit_code(&self) -> i32 {
        match self.decision {
            Decision::Allow => exit_codes::ALLOW,
            Decision::Block => exit_codes::BLOCK,
        }
    }
}

pub struct Dispatcher<P, C> {
    repo: P,
    classifier: C,
    guidance: GuidanceEngine,
}

impl<P: RepoState, C: Classifier> Dispatcher<P, C> {
    pub fn new(repo: P, classifier: C) -> Result<Self> {
        Ok(Self {
            repo,
            classifier,
            guidance: GuidanceEngine::new()?,
        })
    }

    #[instrument(skip_all, fields(event = event.as_str(), session_id = ?ctx.session_id()))]
    pub fn dispatch(
        &self,
        event: HookEvent,
        input: &HookInput,
        ctx: &mut SessionContext,
    ) -> HookResponse {
        let response = match event {
            HookEvent::BeforeAction => self.before_action(input, ctx),
            HookEvent::AfterAction => self.after_action(input, ctx),
            HookEvent::AtExit => self.at_exit(input, ctx),
            HookEvent::PreTruncation => self.pre_truncation(ctx),
        };
        debug!(
            decision = ?response.decision,
            reason = response.reason.map(BlockReason::as_str),
            "hook decided"
        );
        response
    }

    fn render<S: Serialize>(&self, kind: Guidance, values: &S) -> String {
        self.guidance.render(kind, values)
    }

    // --- before-action --------------------------------------------------

    fn before_action(&self, input: &HookInput, ctx: &mut SessionContext) -> HookResponse {
        if let Some(command) = input.command()
            && let Some(response) = self.check_command_safety(command, ctx)
        {
            return response;
        }
        if input.is_write_like() {
            for path in input.target_paths() {
                let rel = relativize(&ctx.paths.root, &path);
                if is_within(&rel, STATE_DIR) {
                    ctx.record(
                        EventCategory::Safety,
                        "protected_state_blocked",
                        format!("write to {rel} blocked"),
                        json!({ "path": rel, "operation": input.operation() }),
                    );
                    return HookResponse::block(
                        BlockReason::ProtectedState,
                        self.render(Guidance::ProtectedState, &context! { path => rel }),
                    );
                }
            }
        }

        if let Some(response) = self.halted(ctx) {
            return response;
        }

        if let Some(command) = input.command()
            && is_git_commit(command)
            && let Some(response) = self.check_commit_scope(ctx)
        {
            return response;
        }

        let mut advisories = Vec::new();
        if input.is_write_like() {
            for path in input.target_paths() {
                match self.check_edit_scope(&path, ctx) {
                    Some(EditScope::Block(response)) => return response,
                    Some(EditScope::Advise(text)) => advisories.push(text),
                    None => {}
                }
            }
        }
        if let Some(warning) = self.ceiling_warning(ctx) {
            advisories.push(warning);
        }
        if advisories.is_empty() {
            HookResponse::allow()
        } else {
            HookResponse::advise(advisories.join("\n"))
        }
    }

    fn check_command_safety(
        &self,
        command: &str,
        ctx: &mut SessionContext,
    ) -> Option<HookResponse> {
        let branch = if command.contains("push") {
            self.repo.current_branch()
        } else {
            None
        };
        let danger_ctx = DangerContext {
            protected_branches: &ctx.config.protected_branches,
            current_branch: branch.as_deref(),
        };
        if let Some(found) = check_command(command, &danger_ctx) {
            warn!(signature = found.signature, "destructive command blocked");
            ctx.record(
                EventCategory::Safety,
                "dangerous_operation_blocked",
                found.description.clone(),
                json!({ "signature": found.signature, "segment": found.segment }),
            );
            return Some(HookResponse::block(
                BlockReason::DangerousOperation,
                self.render(Guidance::DangerousOperation, &found),
            ));
        }

        if let Some(segment) = operator_invocation(command, OPERATOR_PROGRAM) {
            ctx.record(
                EventCategory::Safety,
                "operator_command_blocked",
                format!("agent ran operator command: {segment}"),
                json!({ "segment": segment }),
            );
            return Some(HookResponse::block(
                BlockReason::ProtectedState,
                self.render(Guidance::OperatorOnly, &context! { command => segment }),
            ));
        }

        if let Some(segment) = protected_write(command, STATE_DIR) {
            ctx.record(
                EventCategory::Safety,
                "protected_state_blocked",
                format!("shell write into {STATE_DIR} blocked"),
                json!({ "segment": segment }),
            );
            return Some(HookResponse::block(
                BlockReason::ProtectedState,
                self.render(Guidance::ProtectedState, &context! { path => segment }),
            ));
        }
        None
    }

    /// In autonomous mode, refuse further actions once the loop has stopped.
    fn halted(&self, ctx: &SessionContext) -> Option<HookResponse> {
        if !ctx.autonomous {
            return None;
        }
        if ctx.breaker.is_open() {
            return Some(HookResponse::block(
                BlockReason::CircuitOpen,
                self.render(
                    Guidance::CircuitOpen,
                    &context! {
                        consecutive_failures => ctx.breaker.consecutive_failures,
                        threshold => ctx.breaker.threshold,
                        reason => ctx.breaker.last_failure_reason,
                    },
                ),
            ));
        }
        let session = ctx.live_session()?;
        let reason = if session.status == SessionStatus::Paused {
            Some((
                BlockReason::Escalation,
                "the session is paused for human review",
            ))
        } else if session.iteration >= session.max_iterations {
            Some((
                BlockReason::IterationCeiling,
                "the iteration ceiling was reached",
            ))
        } else {
            None
        };
        reason.map(|(block, why)| HookResponse::block(block, self.handoff_guidance(ctx, why)))
    }

    fn check_commit_scope(&self, ctx: &mut SessionContext) -> Option<HookResponse> {
        let task = ctx.task.as_ref().filter(|t| !t.scope.is_empty())?;
        let Some(staged) = self.repo.staged_files() else {
            warn!("staged file list unavailable; commit scope check skipped");
            return None;
        };
        let blocked = staged
            .iter()
            .map(|path| task.scope.evaluate(path))
            .find(|verdict| !verdict.is_allowed())?;
        Some(self.scope_block(ctx, blocked, "commit", true))
    }

    fn check_edit_scope(&self, path: &str, ctx: &mut SessionContext) -> Option<EditScope> {
        let task = ctx.task.as_ref().filter(|t| !t.scope.is_empty())?;
        let rel = relativize(&ctx.paths.root, path);
        let verdict = task.scope.evaluate(&rel);
        if verdict.is_allowed() {
            return None;
        }
        let enforce = ctx.config.scope.edit_check == EditCheck::Enforce;
        let response = self.scope_block(ctx, verdict, "edit", enforce);
        Some(if enforce {
            EditScope::Block(response)
        } else {
            EditScope::Advise(response.guidance.unwrap_or_default())
        })
    }

    fn scope_block(
        &self,
        ctx: &mut SessionContext,
        verdict: ScopeVerdict,
        stage: &str,
        enforced: bool,
    ) -> HookResponse {
        let ScopeVerdict::Blocked {
            path,
            violation,
            allowed,
        } = verdict
        else {
            return HookResponse::allow();
        };
        let rule = match &violation {
            ScopeViolation::Denied { rule } => Some(rule.to_string()),
            ScopeViolation::NotAllowed => None,
        };
        let (task_id, task_title) = ctx
            .task
            .as_ref()
            .map(|t| (t.id.clone(), t.title.clone()))
            .unwrap_or_default();

        info!(path = %path, stage, enforced, "scope violation");
        ctx.record(
            EventCategory::Scope,
            "scope_violation",
            format!("{path} is outside the scope of task {task_id}"),
            json!({
                "path": path,
                "rule": rule,
                "allowed": allowed,
                "stage": stage,
                "enforced": enforced,
                "task_id": task_id,
            }),
        );
        HookResponse::block(
            BlockReason::ScopeViolation,
            self.render(
                Guidance::ScopeViolation,
                &context! { path, task_id, task_title, rule, allowed },
            ),
        )
    }

    fn ceiling_warning(&self, ctx: &SessionContext) -> Option<String> {
        let session = ctx.live_session()?;
        let near_iterations = ctx
            .config
            .near_ceiling(session.iteration, session.max_iterations);
        let near_failures = ctx
            .config
            .near_ceiling(ctx.breaker.consecutive_failures, ctx.breaker.threshold);
        if !near_iterations && !near_failures {
            return None;
        }
        Some(self.render(
            Guidance::CeilingWarning,
            &context! {
                near_iterations,
                iteration => session.iteration,
                max_iterations => session.max_iterations,
                near_failures,
                consecutive_failures => ctx.breaker.consecutive_failures,
                max_failures => ctx.breaker.threshold,
            },
        ))
    }

    // --- after-action ---------------------------------------------------

    fn after_action(&self, input: &HookInput, ctx: &mut SessionContext) -> HookResponse {
        let Some(session) = ctx.live_session() else {
            debug!("no live session; after-action is a no-op");
            return HookResponse::allow();
        };
        let session_id = session.id.clone();
        let mode = session.mode;
        let iteration = session.iteration;
        let mut ladder = Ladder {
            tier: session.model_tier,
            consecutive_failures: session.consecutive_failures,
        };

        if let Some(usage) = &input.usage
            && let Some(session) = ctx.session.as_mut()
        {
            session.cost_usd += usage.cost_usd;
            session.input_tokens = session.input_tokens.saturating_add(usage.input_tokens);
            session.output_tokens = session.output_tokens.saturating_add(usage.output_tokens);
            ctx.touch_session();
        }

        let text = input.result_text();
        let outcome = classify_result(&text, input.error_flag());
        let gates = detect_gates(input.command(), &text);
        if gates.is_empty() || outcome == ActionOutcome::Unknown {
            debug!(?outcome, gates = gates.len(), "no gate verdict; breaker untouched");
            return HookResponse::allow();
        }

        let passed = outcome == ActionOutcome::Success;
        let gate_names: Vec<&str> = gates.iter().map(|g| g.as_str()).collect();
        let task_id = ctx.task_id().map(str::to_string);
        for gate in &gates {
            ctx.record_gate(GateResult {
                session_id: Some(session_id.clone()),
                task_id: task_id.clone(),
                gate: gate.as_str().to_string(),
                passed,
                iteration,
            });
        }
        ctx.record(
            EventCategory::Gate,
            if passed { "gate_passed" } else { "gate_failed" },
            format!(
                "{} {}",
                gate_names.join(", "),
                if passed { "passed" } else { "failed" }
            ),
            json!({ "gates": gate_names, "command": input.command() }),
        );

        if ctx.breaker.is_open() {
            return HookResponse::block(
                BlockReason::CircuitOpen,
                self.circuit_open_guidance(ctx),
            );
        }

        let attempt = if passed {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failure {
                reason: format!("{} failed", gate_names.join(", ")),
            }
        };
        let policy = ctx.config.breaker_policy();
        ctx.breaker.total_iterations = ctx.breaker.total_iterations.saturating_add(1);
        let update = apply_outcome(&mut ladder, &mut ctx.breaker, &attempt, mode, &policy);
        ctx.touch_breaker();

        if let Some(session) = ctx.session.as_mut() {
            session.model_tier = ladder.tier;
            session.consecutive_failures = ladder.consecutive_failures;
            if update.tripped {
                session.status = SessionStatus::Aborted;
            } else if update.ladder_exhausted {
                session.status = SessionStatus::Paused;
            }
        }
        ctx.touch_session();

        let mut attempt_events = vec![if passed {
            AttemptEvent::GatePassed
        } else {
            AttemptEvent::GateFailed
        }];
        if let Some(promotion) = update.promotion {
            attempt_events.push(AttemptEvent::Escalated { to: promotion.to });
        }
        if update.ladder_exhausted {
            attempt_events.push(AttemptEvent::Handoff);
        }
        if update.tripped {
            attempt_events.push(AttemptEvent::BreakerOpen);
        }
        advance_task(ctx, ladder.tier, &attempt_events);

        if let Some(promotion) = update.promotion {
            let reason = format!(
                "{} consecutive gate failures ({})",
                promotion.failure_count,
                gate_names.join(", ")
            );
            info!(
                from = promotion.from.as_str(),
                to = promotion.to.as_str(),
                failure_count = promotion.failure_count,
                "model tier promoted"
            );
            ctx.record_escalation(Escalation {
                session_id: session_id.clone(),
                task_id: task_id.clone(),
                from_tier: promotion.from,
                to_tier: promotion.to,
                reason: reason.clone(),
                failure_count: promotion.failure_count,
                iteration,
                created_at: clock::now(),
            });
            ctx.record(
                EventCategory::Escalation,
                "tier_promoted",
                reason,
                json!({ "from": promotion.from.as_str(), "to": promotion.to.as_str() }),
            );
        }

        if update.tripped {
            warn!(
                consecutive_failures = ctx.breaker.consecutive_failures,
                "circuit breaker tripped; session aborted"
            );
            ctx.record(
                EventCategory::Breaker,
                "breaker_tripped",
                format!(
                    "{} consecutive failures reached the limit of {}",
                    ctx.breaker.consecutive_failures, ctx.breaker.threshold
                ),
                json!({ "reason": ctx.breaker.last_failure_reason }),
            );
            return HookResponse::block(BlockReason::CircuitOpen, self.circuit_open_guidance(ctx));
        }

        if update.ladder_exhausted {
            info!("escalation ladder exhausted; handing off");
            ctx.record(
                EventCategory::Escalation,
                "handoff",
                "escalation exhausted at the diagnostic tier",
                json!({ "gates": gate_names }),
            );
            return HookResponse::block(
                BlockReason::Escalation,
                self.handoff_guidance(ctx, "repeated gate failures at the diagnostic tier"),
            );
        }

        if let Some(promotion) = update.promotion {
            let tiers = &ctx.config.tiers;
            return HookResponse::block(
                BlockReason::Escalation,
                self.render(
                    Guidance::Escalation,
                    &context! {
                        failure_count => promotion.failure_count,
                        from_tier => promotion.from.as_str(),
                        from_name => tiers.name(promotion.from),
                        to_tier => promotion.to.as_str(),
                        to_name => tiers.name(promotion.to),
                        gates => gate_names,
                    },
                ),
            );
        }

        if !passed {
            return HookResponse::block(
                BlockReason::GateFailure,
                self.render(
                    Guidance::GateFailure,
                    &context! {
                        gates => gate_names,
                        consecutive_failures => ladder.consecutive_failures,
                        threshold => policy.escalation_threshold(mode),
                    },
                ),
            );
        }
        HookResponse::allow()
    }

    fn circuit_open_guidance(&self, ctx: &SessionContext) -> String {
        self.render(
            Guidance::CircuitOpen,
            &context! {
                consecutive_failures => ctx.breaker.consecutive_failures,
                threshold => ctx.breaker.threshold,
                reason => ctx.breaker.last_failure_reason,
            },
        )
    }

    fn handoff_guidance(&self, ctx: &SessionContext, reason: &str) -> String {
        let (iteration, max_iterations, tier) = ctx
            .session
            .as_ref()
            .map(|s| (s.iteration, s.max_iterations, s.model_tier))
            .unwrap_or((0, ctx.config.max_iterations, ModelTier::default()));
        self.render(
            Guidance::Handoff,
            &context! {
                task_id => ctx.task_id(),
                reason,
                iteration,
                max_iterations,
                tier => tier.as_str(),
                tier_name => ctx.config.tiers.name(tier),
            },
        )
    }

    // --- at-exit --------------------------------------------------------

    fn at_exit(&self, input: &HookInput, ctx: &mut SessionContext) -> HookResponse {
        if !ctx.autonomous {
            return HookResponse::allow();
        }
        let Some(session) = ctx.live_session() else {
            debug!("no live session; exit allowed");
            return HookResponse::allow();
        };
        if ctx.breaker.is_open() {
            debug!("breaker open; exit allowed");
            return HookResponse::allow();
        }
        let handed_off = session.status == SessionStatus::Paused
            || ctx
                .task
                .as_ref()
                .is_some_and(|t| t.attempt_state == AttemptState::Handoff);
        if handed_off {
            debug!("session handed off; exit allowed");
            return HookResponse::allow();
        }
        if session.iteration >= session.max_iterations {
            info!(
                iteration = session.iteration,
                "iteration ceiling reached; handing off"
            );
            if let Some(session) = ctx.session.as_mut() {
                session.status = SessionStatus::Paused;
            }
            ctx.touch_session();
            let tier = ctx.model_tier();
            advance_task(ctx, tier, &[AttemptEvent::Handoff]);
            ctx.record(
                EventCategory::Exit,
                "iteration_ceiling",
                "iteration ceiling reached; exit allowed",
                json!({}),
            );
            return HookResponse::allow();
        }

        let extra = ctx.config.completion_markers.clone();
        let classification = self.classifier.classify(
            input.output_text(),
            &ClassifyContext {
                task_active: ctx.task.is_some(),
                extra_completion_markers: &extra,
            },
        );
        if classification.category == Category::LegitimateCompletion {
            info!(marker = ?classification.matched, "completion marker found; session completed");
            if let Some(session) = ctx.session.as_mut() {
                session.status = SessionStatus::Completed;
            }
            ctx.touch_session();
            ctx.record(
                EventCategory::Exit,
                "exit_completed",
                "completion marker found",
                json!({ "matched": classification.matched }),
            );
            return HookResponse::allow();
        }

        if let Some(session) = ctx.session.as_mut() {
            session.iteration = session.iteration.saturating_add(1);
        }
        ctx.touch_session();

        let checkpoint_id = CheckpointManager::new(&ctx.paths, ctx.accessor())
            .save(ctx.snapshot("exit blocked"))
            .map(|cp| cp.id)
            .map_err(|err| warn!(err = format!("{err:#}"), "exit checkpoint not saved"))
            .ok();

        let (iteration, max_iterations) = ctx
            .session
            .as_ref()
            .map_or((0, 0), |s| (s.iteration, s.max_iterations));
        info!(
            iteration,
            category = classification.category.as_str(),
            "exit blocked"
        );
        ctx.record(
            EventCategory::Exit,
            "exit_blocked",
            format!("exit blocked ({})", classification.category.as_str()),
            json!({
                "category": classification.category.as_str(),
                "matched": classification.matched,
                "iteration": iteration,
                "checkpoint_id": checkpoint_id,
            }),
        );
        HookResponse::block(
            BlockReason::ExitWithoutCompletion,
            self.render(
                Guidance::ExitBlocked,
                &context! {
                    iteration,
                    max_iterations,
                    category => classification.category.as_str(),
                    matched => classification.matched,
                    task_id => ctx.task_id(),
                    task_title => ctx.task.as_ref().map(|t| t.title.clone()),
                    checkpoint_id,
                },
            ),
        )
    }

    // --- pre-truncation -------------------------------------------------

    fn pre_truncation(&self, ctx: &mut SessionContext) -> HookResponse {
        let checkpoint_id = CheckpointManager::new(&ctx.paths, ctx.accessor())
            .save(ctx.snapshot("pre-truncation"))
            .map(|cp| cp.id)
            .map_err(|err| {
                warn!(
                    err = format!("{err:#}"),
                    "pre-truncation checkpoint not saved"
                )
            })
            .ok();

        let note = resume_note(ctx, checkpoint_id.clone());
        if let Err(err) = write_resume_note(&ctx.paths.resume_note_path, &self.guidance, &note) {
            warn!(err = format!("{err:#}"), "resume note not written");
        }
        ctx.record(
            EventCategory::Checkpoint,
            "pre_truncation_snapshot",
            "resume note and checkpoint written",
            json!({ "checkpoint_id": checkpoint_id }),
        );
        HookResponse::allow()
    }
}

enum EditScope {
    Block(HookResponse),
    Advise(String),
}

/// Feed attempt events to the active task; invalid transitions are logged and skipped.
fn advance_task(ctx: &mut SessionContext, tier: ModelTier, events: &[AttemptEvent]) {
    let Some(task) = ctx.task.as_mut() else {
        return;
    };
    let mut state = task.attempt_state;
    if state == AttemptState::Queued {
        state = AttemptState::Running;
    }
    for event in events {
        match advance(state, *event) {
            Ok(next) => state = next,
            Err(err) => {
                warn!(task_id = %task.id, err = %err, "attempt transition rejected");
                break;
            }
        }
    }
    task.attempt_state = state;
    task.model_tier = tier;
    if events.contains(&AttemptEvent::GateFailed) || events.contains(&AttemptEvent::GatePassed) {
        task.iteration = task.iteration.saturating_add(1);
    }
    ctx.touch_task();
}

fn resume_note(ctx: &SessionContext, checkpoint_id: Option<String>) -> ResumeNote {
    let tier = ctx.model_tier();
    ResumeNote {
        written_at: clock::now(),
        session_id: ctx.session_id().map(str::to_string),
        session_status: ctx.session.as_ref().map(|s| s.status.as_str().to_string()),
        task_id: ctx.task_id().map(str::to_string),
        task_title: ctx.task.as_ref().map(|t| t.title.clone()),
        task_status: ctx.task.as_ref().map(|t| t.status.as_str().to_string()),
        attempt_state: ctx
            .task
            .as_ref()
            .map(|t| t.attempt_state.as_str().to_string()),
        tier: tier.as_str().to_string(),
        tier_name: ctx.config.tiers.name(tier).to_string(),
        iteration: ctx.session.as_ref().map_or(0, |s| s.iteration),
        max_iterations: ctx
            .session
            .as_ref()
            .map_or(ctx.config.max_iterations, |s| s.max_iterations),
        breaker_state: ctx.breaker.state.as_str().to_string(),
        breaker_failures: ctx.breaker.consecutive_failures,
        breaker_threshold: ctx.breaker.threshold,
        autonomous: ctx.autonomous,
        checkpoint_id,
        allowed: ctx
            .task
            .as_ref()
            .map(|t| t.scope.allow_patterns())
            .unwrap_or_default(),
    }
}

/// Load state for `paths`, dispatch one event, and persist the result.
pub fn run_hook(paths: StatePaths, event: HookEvent, raw_input: &str) -> Result<HookResponse> {
    let mut ctx = SessionContext::load(paths);
    let repo = GitRepo::new(ctx.paths.root.clone(), ctx.config.subcheck.timeout());
    let dispatcher = Dispatcher::new(repo, PatternClassifier)?;
    let input = HookInput::parse(raw_input);
    let response = dispatcher.dispatch(event, &input, &mut ctx);
    ctx.persist();
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breaker::BreakerState;
    use crate::core::scope::ScopeRules;
    use crate::core::types::TaskStatus;
    use crate::io::git::NoRepo;
    use crate::test_support::{TestProject, after_action, at_exit, before_write, shell};

    struct StagedRepo(Vec<String>);

    impl RepoState for StagedRepo {
        fn current_branch(&self) -> Option<String> {
            Some("main".to_string())
        }

        fn staged_files(&self) -> Option<Vec<String>> {
            Some(self.0.clone())
        }
    }

    fn dispatcher() -> Dispatcher<NoRepo, PatternClassifier> {
        Dispatcher::new(NoRepo, PatternClassifier).expect("dispatcher")
    }

    fn scoped_project() -> TestProject {
        let project = TestProject::new().expect("project");
        project.start_session().expect("session");
        let rules = ScopeRules::parse("+api/**\n!api/secrets\n").expect("rules");
        project.start_task("t1", rules).expect("task");
        project
    }

    #[test]
    fn destructive_command_blocks_without_any_state() {
        let project = TestProject::bare().expect("project");
        let mut ctx = project.context();
        let response = dispatcher().dispatch(HookEvent::BeforeAction, &shell("rm -rf /"), &mut ctx);
        assert_eq!(response.reason, Some(BlockReason::DangerousOperation));
        assert_eq!(response.exit_code(), exit_codes::BLOCK);
    }

    #[test]
    fn scope_rules_gate_writes() {
        let project = scoped_project();
        let d = dispatcher();

        let mut ctx = project.context();
        let input = before_write("api/secrets/key.txt");
        let blocked = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(blocked.reason, Some(BlockReason::ScopeViolation));
        let guidance = blocked.guidance.expect("guidance");
        assert!(guidance.contains("`!api/secrets`"));
        assert!(guidance.contains("- `api/**`"));

        let input = before_write("api/routes.go");
        let allowed = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert!(!allowed.is_blocked());
        let input = before_write("apiextra.go");
        let outside = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(outside.reason, Some(BlockReason::ScopeViolation));
        ctx.persist();

        let scope_events = project
            .store()
            .count_events(&project.session_id(), Some(EventCategory::Scope))
            .expect("count");
        assert_eq!(scope_events, 2);
    }

    #[test]
    fn advisory_edit_check_warns_but_commit_check_blocks() {
        let project = scoped_project();
        let mut ctx = project.context();
        ctx.config.scope.edit_check = EditCheck::Advisory;

        let input = before_write("docs/readme.md");
        let edit = dispatcher().dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert!(!edit.is_blocked());
        assert!(edit.guidance.expect("advice").contains("docs/readme.md"));

        let committing = Dispatcher::new(
            StagedRepo(vec!["api/routes.go".to_string(), "docs/readme.md".to_string()]),
            PatternClassifier,
        )
        .expect("dispatcher");
        let input = shell("git commit -m docs");
        let commit = committing.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(commit.reason, Some(BlockReason::ScopeViolation));
    }

    #[test]
    fn state_directory_and_operator_commands_are_protected() {
        let project = scoped_project();
        let d = dispatcher();
        let mut ctx = project.context();

        let input = before_write(".loopguard/scope");
        let write = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(write.reason, Some(BlockReason::ProtectedState));
        let input = shell("rm .loopguard/autonomous");
        let shell_write = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(shell_write.reason, Some(BlockReason::ProtectedState));
        let input = shell("loopguard breaker reset");
        let reset = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(reset.reason, Some(BlockReason::ProtectedState));
        let input = shell("loopguard session status");
        let status = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert!(!status.is_blocked());
    }

    #[test]
    fn two_failures_escalate_once_and_reset_counter() {
        let project = scoped_project();
        let d = dispatcher();

        let mut ctx = project.context();
        let input = after_action("cargo test", "test result: FAILED. 1 failed");
        let first = d.dispatch(HookEvent::AfterAction, &input, &mut ctx);
        assert_eq!(first.reason, Some(BlockReason::GateFailure));
        ctx.persist();

        let mut ctx = project.context();
        let input = after_action("cargo test", "test result: FAILED. 1 failed");
        let second = d.dispatch(HookEvent::AfterAction, &input, &mut ctx);
        assert_eq!(second.reason, Some(BlockReason::Escalation));
        ctx.persist();

        let mut ctx = project.context();
        let input = after_action("cargo test", "test result: FAILED. 1 failed");
        let third = d.dispatch(HookEvent::AfterAction, &input, &mut ctx);
        assert_eq!(third.reason, Some(BlockReason::GateFailure));
        ctx.persist();

        let store = project.store();
        let id = project.session_id();
        let escalations = store.escalations(&id).expect("escalations");
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].from_tier, ModelTier::Tier1);
        assert_eq!(escalations[0].to_tier, ModelTier::Tier2);
        let session = store.session(&id).expect("read").expect("session");
        assert_eq!(session.model_tier, ModelTier::Tier2);
        assert_eq!(session.consecutive_failures, 1);
        let task = store.task("t1").expect("read").expect("task");
        assert_eq!(task.attempt_state, AttemptState::GateFailed);
        assert_eq!(task.model_tier, ModelTier::Tier2);
    }

    #[test]
    fn success_resets_counters_without_demotion() {
        let project = scoped_project();
        let d = dispatcher();
        for output in ["1 failed", "1 failed", "test result: ok. 3 passed"] {
            let mut ctx = project.context();
            let input = after_action("cargo test", output);
            d.dispatch(HookEvent::AfterAction, &input, &mut ctx);
            ctx.persist();
        }
        let store = project.store();
        let id = project.session_id();
        let session = store.session(&id).expect("read").expect("session");
        assert_eq!(session.model_tier, ModelTier::Tier2);
        assert_eq!(session.consecutive_failures, 0);
        let breaker = store.breaker(&id).expect("read").expect("breaker");
        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.total_iterations, 3);
    }

    #[test]
    fn unknown_outcome_leaves_breaker_alone() {
        let project = scoped_project();
        let mut ctx = project.context();
        let input = after_action("ls", "a\nb\n");
        let response = dispatcher().dispatch(HookEvent::AfterAction, &input, &mut ctx);
        assert!(!response.is_blocked());
        assert_eq!(ctx.breaker.total_iterations, 0);
    }

    #[test]
    fn breaker_trips_once_and_aborts_the_session() {
        let project = scoped_project();
        let d = dispatcher();
        let mut reasons = Vec::new();
        for _ in 0..6 {
            let mut ctx = project.context();
            let input = after_action("cargo test", "2 failed");
            let response = d.dispatch(HookEvent::AfterAction, &input, &mut ctx);
            reasons.push(response.reason);
            ctx.persist();
        }
        assert_eq!(reasons[4], Some(BlockReason::CircuitOpen));
        let store = project.store();
        let id = project.session_id();
        let breaker = store.breaker(&id).expect("read").expect("breaker");
        assert_eq!(breaker.state, BreakerState::Open);
        assert_eq!(breaker.consecutive_failures, 5);
        let session = store.session(&id).expect("read").expect("session");
        assert_eq!(session.status, SessionStatus::Aborted);
        let breaker_events = store
            .count_events(&id, Some(EventCategory::Breaker))
            .expect("count");
        assert_eq!(breaker_events, 1);
        let task = store.task("t1").expect("read").expect("task");
        assert_eq!(task.attempt_state, AttemptState::Aborted);
    }

    #[test]
    fn autonomous_exit_needs_completion_marker() {
        let project = scoped_project();
        project.set_autonomous(true).expect("autonomous");
        let d = dispatcher();

        let mut ctx = project.context();
        let input = at_exit("Should I continue with the next step?");
        let blocked = d.dispatch(HookEvent::AtExit, &input, &mut ctx);
        assert_eq!(blocked.reason, Some(BlockReason::ExitWithoutCompletion));
        assert!(blocked.guidance.expect("guidance").contains("proceed"));
        ctx.persist();
        assert_eq!(project.session().iteration, 1);
        assert_eq!(project.store().checkpoints(None).expect("list").len(), 1);

        let mut ctx = project.context();
        let input = at_exit("I'm stuck but EXIT_SIGNAL: true");
        let done = d.dispatch(HookEvent::AtExit, &input, &mut ctx);
        assert!(!done.is_blocked());
        ctx.persist();
        let session = project.session();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.iteration, 1);
    }

    #[test]
    fn exit_is_free_outside_autonomous_mode() {
        let project = scoped_project();
        let mut ctx = project.context();
        let response = dispatcher().dispatch(HookEvent::AtExit, &at_exit("I give up"), &mut ctx);
        assert!(!response.is_blocked());
    }

    #[test]
    fn iteration_ceiling_releases_exit_and_hands_off() {
        let project = scoped_project();
        project.set_autonomous(true).expect("autonomous");
        project.set_iteration(19).expect("iteration");
        let d = dispatcher();

        let mut ctx = project.context();
        let blocked = d.dispatch(HookEvent::AtExit, &at_exit("I give up"), &mut ctx);
        assert!(blocked.is_blocked());
        ctx.persist();
        assert_eq!(project.session().iteration, 20);

        let mut ctx = project.context();
        let released = d.dispatch(HookEvent::AtExit, &at_exit("I give up"), &mut ctx);
        assert!(!released.is_blocked());
        ctx.persist();
        let session = project.session();
        assert_eq!(session.iteration, 20);
        assert_eq!(session.status, SessionStatus::Paused);
        let task = project.store().task("t1").expect("read").expect("task");
        assert_eq!(task.attempt_state, AttemptState::Handoff);
        assert_eq!(task.status, TaskStatus::InProgress);

        let mut ctx = project.context();
        let input = before_write("api/routes.go");
        let action = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(action.reason, Some(BlockReason::Escalation));
    }

    #[test]
    fn ceiling_warning_is_advisory() {
        let project = scoped_project();
        project.set_iteration(17).expect("iteration");
        let mut ctx = project.context();
        let input = before_write("api/routes.go");
        let response = dispatcher().dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert!(!response.is_blocked());
        let warning = response.guidance.expect("warning");
        assert!(warning.contains("iteration 17 of 20"));
    }

    #[test]
    fn pre_truncation_writes_resume_note_and_checkpoint() {
        let project = scoped_project();
        project.set_autonomous(true).expect("autonomous");
        let mut ctx = project.context();
        let input = HookInput::default();
        let response = dispatcher().dispatch(HookEvent::PreTruncation, &input, &mut ctx);
        assert!(!response.is_blocked());
        ctx.persist();

        let note = std::fs::read_to_string(&project.paths().resume_note_path).expect("note");
        assert!(note.contains(&project.session_id()));
        assert!(note.contains("Task: t1"));
        assert!(note.contains("Autonomous mode: on"));
        assert_eq!(project.store().checkpoints(None).expect("list").len(), 1);
    }

    #[test]
    fn disabled_store_still_decides() {
        let project = scoped_project();
        project.set_autonomous(true).expect("autonomous");
        let mut ctx = project.context_without_store();
        let d = dispatcher();

        let write = before_write("anything.rs");
        let action = d.dispatch(HookEvent::BeforeAction, &write, &mut ctx);
        assert!(!action.is_blocked());
        let failed = after_action("cargo test", "1 failed");
        let gate = d.dispatch(HookEvent::AfterAction, &failed, &mut ctx);
        assert!(!gate.is_blocked());
        let exit = d.dispatch(HookEvent::AtExit, &at_exit("I give up"), &mut ctx);
        assert!(!exit.is_blocked());
        ctx.persist();
    }

    #[test]
    fn exhausted_ladder_releases_exit_without_counting() {
        let project = scoped_project();
        project.set_autonomous(true).expect("autonomous");
        let mut diagnostic = project.session();
        diagnostic.model_tier = ModelTier::Diagnostic;
        diagnostic.consecutive_failures = 1;
        let store = project.store();
        store.update_session(&diagnostic).expect("diagnostic");
        let d = dispatcher();

        let mut ctx = project.context();
        let handoff = d.dispatch(
            HookEvent::AfterAction,
            &after_action("cargo test", "1 failed"),
            &mut ctx,
        );
        assert_eq!(handoff.reason, Some(BlockReason::Escalation));
        ctx.persist();
        assert_eq!(project.session().status, SessionStatus::Paused);

        let mut ctx = project.context();
        let input = before_write("api/routes.go");
        let action = d.dispatch(HookEvent::BeforeAction, &input, &mut ctx);
        assert_eq!(action.reason, Some(BlockReason::Escalation));

        let mut ctx = project.context();
        let input = at_exit("Handing off for review.");
        let exit = d.dispatch(HookEvent::AtExit, &input, &mut ctx);
        assert!(!exit.is_blocked());
        ctx.persist();
        assert_eq!(project.session().iteration, 0);
        assert!(project.store().checkpoints(None).expect("list").is_empty());
    }

    #[test]
    fn overlapping_blocked_exits_both_count() {
        let project = scoped_project();
        project.set_autonomous(true).expect("autonomous");
        let d = dispatcher();

        let mut first = project.context();
        let mut second = project.context();
        for ctx in [&mut first, &mut second] {
            let response = d.dispatch(HookEvent::AtExit, &at_exit("hmm"), ctx);
            assert_eq!(response.reason, Some(BlockReason::ExitWithoutCompletion));
        }
        assert!(first.persist());
        assert!(second.persist());
        assert_eq!(project.session().iteration, 2);
    }

    #[test]
    fn operator_rescope_survives_an_in_flight_hook() {
        let project = scoped_project();
        let mut ctx = project.context();
        let response = dispatcher().dispatch(
            HookEvent::AfterAction,
            &after_action("cargo test", "1 failed"),
            &mut ctx,
        );
        assert_eq!(response.reason, Some(BlockReason::GateFailure));

        let narrowed = ScopeRules::parse("+api/**\n!api/secrets\n-api/keys.go\n").expect("rules");
        crate::session::set_task_scope(&project.store(), "t1", narrowed.clone(), true)
            .expect("rescope");
        assert!(ctx.persist());

        let task = project.store().task("t1").expect("read").expect("task");
        assert_eq!(task.scope, narrowed);
        assert_eq!(task.attempt_state, AttemptState::GateFailed);
        assert_eq!(task.iteration, 1);
    }
}
