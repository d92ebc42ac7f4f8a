//! Shell-command shapes the before-action handler inspects besides danger:
//! commits, operator-only invocations, and writes into the state directory.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::danger::{git_subcommand, program, split_segments, tokenize};

/// Operator subcommands an agent may run because they only read state.
const AGENT_READABLE: &[&[&str]] = &[
    &["session", "status"],
    &["session", "get"],
    &["breaker", "status"],
    &["checkpoint", "list"],
    &["scope", "check"],
    &["help"],
    &["--help"],
    &["-h"],
    &["--version"],
    &["-V"],
];

/// Programs that modify any path argument they are given.
const MUTATORS: &[&str] = &[
    "rm", "rmdir", "unlink", "touch", "truncate", "tee", "chmod", "chown", "sqlite3", "shred",
];

/// Programs whose last argument is the destination.
const COPIERS: &[&str] = &["cp", "mv", "install", "ln", "rsync"];

/// True if any segment runs `git commit`.
pub fn is_git_commit(command: &str) -> bool {
    split_segments(command).iter().any(|segment| {
        let tokens = tokenize(segment);
        git_subcommand(&tokens).is_some_and(|(_, name)| name == "commit")
    })
}

/// The first segment invoking `name` with a state-changing subcommand.
pub fn operator_invocation(command: &str, name: &str) -> Option<String> {
    split_segments(command).into_iter().find(|segment| {
        let tokens = tokenize(segment);
        if program(&tokens) != Some(name) {
            return false;
        }
        let args: Vec<&str> = tokens[1..].iter().map(String::as_str).collect();
        !AGENT_READABLE
            .iter()
            .any(|allowed| args.len() >= allowed.len() && args[..allowed.len()] == **allowed)
    })
}

/// The first segment that writes, moves, or deletes something under `dir`.
pub fn protected_write(command: &str, dir: &str) -> Option<String> {
    static REDIRECT: LazyLock<Option<Regex>> =
        LazyLock::new(|| Regex::new(r">>?\s*(?P<target>[^\s;&|]+)").ok());

    split_segments(command).into_iter().find(|segment| {
        if !segment.contains(dir) {
            return false;
        }
        let redirected = REDIRECT.as_ref().is_some_and(|re| {
            re.captures_iter(segment)
                .filter_map(|caps| caps.name("target"))
                .any(|target| mentions_dir(target.as_str(), dir))
        });
        if redirected {
            return true;
        }

        let tokens = tokenize(segment);
        let Some(name) = program(&tokens) else {
            return false;
        };
        let args = &tokens[1..];
        if MUTATORS.contains(&name) {
            return args.iter().any(|arg| mentions_dir(arg, dir));
        }
        if name == "mv" && args.iter().any(|arg| mentions_dir(arg, dir)) {
            return true;
        }
        if COPIERS.contains(&name) {
            return args.last().is_some_and(|dest| mentions_dir(dest, dir));
        }
        if matches!(name, "sed" | "perl") && args.iter().any(|a| a.starts_with("-i")) {
            return args.iter().any(|arg| mentions_dir(arg, dir));
        }
        false
    })
}

/// True if a relative path is `dir` itself or anything beneath it.
pub fn is_within(rel: &str, dir: &str) -> bool {
    let rel = rel.trim_start_matches("./");
    rel == dir || rel.strip_prefix(dir).is_some_and(|r| r.starts_with('/'))
}

fn mentions_dir(token: &str, dir: &str) -> bool {
    is_within(token, dir)
        || token
            .match_indices(dir)
            .any(|(idx, _)| {
                let before = &token[..idx];
                let after = &token[idx + dir.len()..];
                before.ends_with('/') && (after.is_empty() || after.starts_with('/'))
            })
}
