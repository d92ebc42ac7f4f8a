//! Classification of action results and quality-gate detection.
//!
//! Failure patterns are checked before success patterns, so text matching both
//! (e.g. "3 passed, 1 failed") is a failure.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ActionOutcome;

static FAILURE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b[1-9]\d*\s+(failed|failures?|errors?)\b",
        r"(?im)^\s*error(\[[A-Za-z0-9]+\])?:",
        r"(?i)\btest result:\s*FAILED",
        r"\bFAIL(ED)?\b",
        r"(?i)\bpanicked at\b",
        r"Traceback \(most recent call last\)",
        r"(?i)\bexit (code|status):?\s*[1-9]\d*",
        r"npm ERR!",
        r"(?i)\b(build|compilation|type ?check) failed\b",
        r"(?i)\bcommand not found\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static SUCCESS_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\btest result:\s*ok\b",
        r"(?i)\b\d+\s+passed\b",
        r"(?i)\ball (tests|checks) passed\b",
        r"(?i)\bbuild succeeded\b",
        r"(?i)\bfinished\b.*\btarget\(s\)",
        r"(?i)\bno (issues|problems|errors) found\b",
        r"(?i)\bsuccess(ful(ly)?)?\b",
        r"^ok\b",
        r"\bPASS(ED)?\b",
        "\u{2713}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Classify the textual result of an action.
///
/// `is_error` is the host's own error flag, when it reports one.
pub fn classify_result(text: &str, is_error: Option<bool>) -> ActionOutcome {
    if is_error == Some(true) {
        return ActionOutcome::Failure;
    }
    if FAILURE_RES.iter().any(|re| re.is_match(text)) {
        return ActionOutcome::Failure;
    }
    if SUCCESS_RES.iter().any(|re| re.is_match(text)) {
        return ActionOutcome::Success;
    }
    if is_error == Some(false) && text.trim().is_empty() {
        return ActionOutcome::Success;
    }
    ActionOutcome::Unknown
}

/// Named automated checks recognised in commands and their output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gate {
    Tests,
    Lint,
    Typecheck,
    Build,
    Format,
    Security,
}

impl Gate {
    pub fn as_str(self) -> &'static str {
        match self {
            Gate::Tests => "tests",
            Gate::Lint => "lint",
            Gate::Typecheck => "typecheck",
            Gate::Build => "build",
            Gate::Format => "format",
            Gate::Security => "security",
        }
    }
}

static COMMAND_GATES: LazyLock<Vec<(Gate, Regex)>> = LazyLock::new(|| {
    compile_gates(&[
        (
            Gate::Tests,
            r"(?i)\b(cargo (nextest run|test)|pytest|go test|npm (run )?test|yarn test|pnpm test|jest|vitest|mvn test|gradle test|dotnet test|rspec)\b",
        ),
        (
            Gate::Lint,
            r"(?i)\b(cargo clippy|eslint|ruff( check)?|flake8|pylint|golangci-lint|rubocop)\b",
        ),
        (Gate::Typecheck, r"(?i)\b(tsc|mypy|pyright|cargo check)\b"),
        (
            Gate::Build,
            r"(?i)(^|[;&|]\s*)(cargo build|npm run build|yarn build|pnpm build|go build|make|mvn package|gradle build|dotnet build)\b",
        ),
        (
            Gate::Format,
            r"(?i)\b(cargo fmt\b.*--check|prettier\b.*--check|black\b.*--check|gofmt -l)",
        ),
        (
            Gate::Security,
            r"(?i)\b(cargo audit|cargo deny|npm audit|bandit|gosec|semgrep)\b",
        ),
    ])
});

/// Signatures that only appear in a check's own output.
static OUTPUT_GATES: LazyLock<Vec<(Gate, Regex)>> = LazyLock::new(|| {
    compile_gates(&[
        (
            Gate::Tests,
            r"(?i)\btest result:|(?m)^=+ .*\b(passed|failed)\b.* =+$",
        ),
        (Gate::Lint, r"\b\d+ problems? \(\d+ errors?"),
        (Gate::Typecheck, r"\berror TS\d+:|\bFound \d+ errors? in\b"),
        (Gate::Build, r"\bBUILD (SUCCESS|FAILURE)\b"),
    ])
});

fn compile_gates(table: &[(Gate, &str)]) -> Vec<(Gate, Regex)> {
    table
        .iter()
        .filter_map(|(gate, pattern)| Regex::new(pattern).ok().map(|re| (*gate, re)))
        .collect()
}

/// Gates referenced by a command or its output, deduplicated and sorted.
pub fn detect_gates(command: Option<&str>, result: &str) -> Vec<Gate> {
    let from_command = COMMAND_GATES
        .iter()
        .filter(|(_, re)| command.is_some_and(|cmd| re.is_match(cmd)));
    let from_output = OUTPUT_GATES.iter().filter(|(_, re)| re.is_match(result));
    let mut gates: Vec<Gate> = from_command
        .chain(from_output)
        .map(|(gate, _)| *gate)
        .collect();
    gates.sort();
    gates.dedup();
    gates
}
