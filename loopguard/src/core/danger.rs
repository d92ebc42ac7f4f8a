//! Destructive-operation signatures for shell commands.
//!
//! Matching is done per command segment (split on `;`, `&&`, `||`, `|`) so a
//! harmless prefix cannot hide a destructive suffix.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// A matched destructive signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DangerMatch {
    pub signature: &'static str,
    pub description: String,
    pub segment: String,
}

/// Inputs that refine force-push detection.
#[derive(Debug, Clone, Default)]
pub struct DangerContext<'a> {
    pub protected_branches: &'a [String],
    /// Current branch if known. `None` means the lookup failed or timed out.
    pub current_branch: Option<&'a str>,
}

static STORAGE_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("sql-drop", r"(?i)\bdrop\s+(database|schema|table)\b"),
        ("sql-truncate", r"(?i)\btruncate\s+table\b"),
        ("mkfs", r"(?i)(^|\s)mkfs(\.\w+)?\s"),
        ("dd-device", r"(?i)\bdd\b.*\bof=/dev/"),
        ("wipefs", r"(?i)(^|\s)(wipefs|shred)\s"),
        ("disk-erase", r"(?i)\bdiskutil\s+erase(disk|volume)\b"),
        ("redirect-device", r">\s*/dev/(sd[a-z]|nvme\d|disk\d)"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
});

/// Git options that take a separate value before the subcommand.
const GIT_VALUE_OPTIONS: &[&str] = &["-C", "-c", "--git-dir", "--work-tree", "--namespace"];

const DANGEROUS_RM_TARGETS: &[&str] = &[
    "/", "/*", "~", "~/", "~/*", "$HOME", "$HOME/", "${HOME}", "*", ".", "./", "..", "../", ".*",
];

/// Check a shell command against every destructive signature.
pub fn check_command(command: &str, ctx: &DangerContext<'_>) -> Option<DangerMatch> {
    for segment in split_segments(command) {
        let tokens = tokenize(&segment);
        if let Some(found) = check_rm(&tokens, &segment) {
            return Some(found);
        }
        if let Some(found) = check_force_push(&tokens, &segment, ctx) {
            return Some(found);
        }
        for (name, re) in STORAGE_RES.iter() {
            if re.is_match(&segment) {
                return Some(DangerMatch {
                    signature: name,
                    description: "command destroys storage or data irreversibly".to_string(),
                    segment: segment.clone(),
                });
            }
        }
    }
    None
}

pub(crate) fn split_segments(command: &str) -> Vec<String> {
    static SEP: LazyLock<Option<Regex>> =
        LazyLock::new(|| Regex::new(r"\|\||&&|;|\||\n").ok());
    match SEP.as_ref() {
        Some(sep) => sep
            .split(command)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => vec![command.trim().to_string()],
    }
}

pub(crate) fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens: Vec<String> = segment
        .split_whitespace()
        .map(|t| t.trim_matches(|c| c == '"' || c == '\'').to_string())
        .collect();
    while tokens
        .first()
        .is_some_and(|t| t == "sudo" || t == "command" || t == "exec" || t.contains('='))
    {
        tokens.remove(0);
    }
    tokens
}

/// Basename of the program a segment runs, so `/bin/rm` reads as `rm`.
pub(crate) fn program(tokens: &[String]) -> Option<&str> {
    tokens
        .first()
        .map(|t| t.rsplit('/').next().unwrap_or(t.as_str()))
}

/// Index and name of the git subcommand, skipping global options.
pub(crate) fn git_subcommand(tokens: &[String]) -> Option<(usize, &str)> {
    if program(tokens) != Some("git") {
        return None;
    }
    let mut idx = 1;
    while let Some(token) = tokens.get(idx) {
        if GIT_VALUE_OPTIONS.contains(&token.as_str()) {
            idx += 2;
        } else if token.starts_with('-') {
            idx += 1;
        } else {
            return Some((idx, token.as_str()));
        }
    }
    None
}

fn check_rm(tokens: &[String], segment: &str) -> Option<DangerMatch> {
    if program(tokens) != Some("rm") {
        return None;
    }
    let mut recursive = false;
    let mut force = false;
    let mut targets = Vec::new();
    for token in &tokens[1..] {
        match token.as_str() {
            "--recursive" => recursive = true,
            "--force" => force = true,
            "--no-preserve-root" => {
                recursive = true;
                force = true;
            }
            t if t.starts_with("--") => {}
            t if t.starts_with('-') && t.len() > 1 => {
                recursive |= t.contains('r') || t.contains('R');
                force |= t.contains('f');
            }
            t => targets.push(t),
        }
    }
    if !(recursive && force) {
        return None;
    }
    let target = targets
        .into_iter()
        .find(|t| DANGEROUS_RM_TARGETS.contains(t))?;
    Some(DangerMatch {
        signature: "rm-recursive-root",
        description: format!("recursive forced delete of '{target}' is irreversible"),
        segment: segment.to_string(),
    })
}

fn check_force_push(
    tokens: &[String],
    segment: &str,
    ctx: &DangerContext<'_>,
) -> Option<DangerMatch> {
    let (push_at, subcommand) = git_subcommand(tokens)?;
    if subcommand != "push" {
        return None;
    }
    let args = &tokens[push_at + 1..];

    let mut forced = false;
    let mut positional: Vec<&str> = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--force" | "-f" => forced = true,
            a if a.starts_with("--force-with-lease") || a.starts_with("--force-if-includes") => {
                forced = true;
            }
            a if a.starts_with('-') && !a.starts_with("--") && a.contains('f') => forced = true,
            a if a.starts_with('-') => {}
            a => positional.push(a),
        }
    }

    // `git push origin +main` is a force push of main.
    let refspec = positional.get(1).copied();
    if refspec.is_some_and(|r| r.starts_with('+')) {
        forced = true;
    }
    if !forced {
        return None;
    }

    let target = match refspec {
        Some(spec) => {
            let spec = spec.trim_start_matches('+');
            let dest = spec.rsplit_once(':').map_or(spec, |(_, dst)| dst);
            Some(dest.trim_start_matches("refs/heads/").to_string())
        }
        None => ctx.current_branch.map(str::to_string),
    };

    let target = target?;
    if !ctx.protected_branches.iter().any(|b| *b == target) {
        return None;
    }
    Some(DangerMatch {
        signature: "force-push-protected",
        description: format!("force-push rewrites history on protected branch '{target}'"),
        segment: segment.to_string(),
    })
}
