//! Guidance text shown to the agent alongside a decision.

use anyhow::Result;
use minijinja::Environment;
use serde::Serialize;
use tracing::warn;

/// Kinds of guidance, one template each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guidance {
    ScopeViolation,
    DangerousOperation,
    ProtectedState,
    OperatorOnly,
    Escalation,
    Handoff,
    CircuitOpen,
    ExitBlocked,
    CeilingWarning,
    GateFailure,
    ResumeNote,
}

const TEMPLATES: &[(Guidance, &str, &str)] = &[
    (
        Guidance::ScopeViolation,
        "scope_violation",
        include_str!("templates/scope_violation.md"),
    ),
    (
        Guidance::DangerousOperation,
        "dangerous_operation",
        include_str!("templates/dangerous_operation.md"),
    ),
    (
        Guidance::ProtectedState,
        "protected_state",
        include_str!("templates/protected_state.md"),
    ),
    (
        Guidance::OperatorOnly,
        "operator_only",
        include_str!("templates/operator_only.md"),
    ),
    (
        Guidance::Escalation,
        "escalation",
        include_str!("templates/escalation.md"),
    ),
    (
        Guidance::Handoff,
        "handoff",
        include_str!("templates/handoff.md"),
    ),
    (
        Guidance::CircuitOpen,
        "circuit_open",
        include_str!("templates/circuit_open.md"),
    ),
    (
        Guidance::ExitBlocked,
        "exit_blocked",
        include_str!("templates/exit_blocked.md"),
    ),
    (
        Guidance::CeilingWarning,
        "ceiling_warning",
        include_str!("templates/ceiling_warning.md"),
    ),
    (
        Guidance::GateFailure,
        "gate_failure",
        include_str!("templates/gate_failure.md"),
    ),
    (
        Guidance::ResumeNote,
        "resume",
        include_str!("templates/resume.md"),
    ),
];

impl Guidance {
    fn template_name(self) -> &'static str {
        TEMPLATES
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map_or("unknown", |(_, name, _)| *name)
    }

    /// Plain text used when rendering fails, so a block never goes out empty.
    fn fallback(self) -> &'static str {
        match self {
            Guidance::ScopeViolation => {
                "BLOCKED: file is outside the active task's scope. Keep changes inside the allowed paths."
            }
            Guidance::DangerousOperation => {
                "BLOCKED: destructive command. Use a scoped, reversible alternative or ask a human."
            }
            Guidance::ProtectedState => {
                "BLOCKED: .loopguard/ is operator-managed state. Continue with the task itself."
            }
            Guidance::OperatorOnly => {
                "BLOCKED: operator-only command. Report what you need instead."
            }
            Guidance::Escalation => {
                "ESCALATION: repeated gate failures; model tier raised. Try a different approach."
            }
            Guidance::Handoff => {
                "HANDOFF: automated attempts exhausted. Summarize what was tried for a human."
            }
            Guidance::CircuitOpen => {
                "CIRCUIT OPEN: failure limit reached. Stop and report; an operator must reset the breaker."
            }
            Guidance::ExitBlocked => {
                "CONTINUE: exit blocked. Finish the work, then end with `EXIT_SIGNAL: true`."
            }
            Guidance::CeilingWarning => "WARNING: approaching loop limits.",
            Guidance::GateFailure => "GATE FAILED: fix the reported failure before moving on.",
            Guidance::ResumeNote => "# Resume note\n\nState snapshot unavailable.\n",
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct GuidanceEngine {
    env: Environment<'static>,
}

impl GuidanceEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (_, name, source) in TEMPLATES {
            env.add_template(*name, *source)?;
        }
        Ok(Self { env })
    }

    /// Render guidance, falling back to fixed text on any template error.
    pub fn render<S: Serialize>(&self, kind: Guidance, ctx: &S) -> String {
        match self.try_render(kind, ctx) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    template = kind.template_name(),
                    err = %err,
                    "guidance render failed; using fallback"
                );
                kind.fallback().to_string()
            }
        }
    }

    fn try_render<S: Serialize>(&self, kind: Guidance, ctx: &S) -> Result<String> {
        let template = self.env.get_template(kind.template_name())?;
        let rendered = template.render(ctx)?;
        Ok(collapse_blank_lines(&rendered))
    }
}

/// Render without an engine instance, for callers that only need one message.
pub fn render_once<S: Serialize>(kind: Guidance, ctx: &S) -> String {
    match GuidanceEngine::new() {
        Ok(engine) => engine.render(kind, ctx),
        Err(err) => {
            warn!(err = %err, "guidance templates failed to load; using fallback");
            kind.fallback().to_string()
        }
    }
}

/// Template conditionals leave runs of blank lines; keep at most one.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.trim().lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
