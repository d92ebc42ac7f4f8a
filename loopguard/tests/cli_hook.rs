//! CLI tests for `loopguard hook` and the operator commands around it.
//!
//! Spawns the binary and verifies the exit-code contract hosts rely on.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use loopguard::exit_codes;

const START_SESSION: [&str; 5] = ["session", "start", "fix", "the", "build"];

fn loopguard(root: &Path, args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_loopguard"))
        .current_dir(root)
        .env_remove("LOOPGUARD_ROOT")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn loopguard");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("loopguard output")
}

fn initialized() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = loopguard(temp.path(), &["init"], "");
    assert_eq!(out.status.code(), Some(exit_codes::ALLOW));
    temp
}

#[test]
fn destructive_command_exits_with_block_code() {
    let temp = initialized();
    let out = loopguard(
        temp.path(),
        &["hook", "before-action"],
        r#"{"tool_name":"Bash","tool_input":{"command":"rm -rf /"}}"#,
    );
    assert_eq!(out.status.code(), Some(exit_codes::BLOCK));
    assert!(!out.stderr.is_empty());
}

#[test]
fn uninitialized_project_still_blocks_destruction() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = loopguard(
        temp.path(),
        &["hook", "before-action"],
        r#"{"tool_name":"Bash","tool_input":{"command":"git push --force origin main"}}"#,
    );
    assert_eq!(out.status.code(), Some(exit_codes::BLOCK));
    assert!(!temp.path().join(".loopguard").exists());
}

#[test]
fn benign_and_malformed_input_are_allowed() {
    let temp = initialized();
    for input in [
        r#"{"tool_name":"Bash","tool_input":{"command":"ls"}}"#,
        "{not json",
        "",
    ] {
        let out = loopguard(temp.path(), &["hook", "before-action"], input);
        assert_eq!(out.status.code(), Some(exit_codes::ALLOW), "input: {input}");
    }
}

#[test]
fn autonomous_exit_is_blocked_until_completion() {
    let temp = initialized();
    let start = loopguard(temp.path(), &START_SESSION, "");
    assert_eq!(start.status.code(), Some(exit_codes::ALLOW));
    let on = loopguard(temp.path(), &["autonomous", "on"], "");
    assert_eq!(on.status.code(), Some(exit_codes::ALLOW));

    let blocked = loopguard(
        temp.path(),
        &["hook", "at-exit"],
        "I'll stop here for now.",
    );
    assert_eq!(blocked.status.code(), Some(exit_codes::BLOCK));

    let done = loopguard(
        temp.path(),
        &["hook", "at-exit"],
        "Build fixed. EXIT_SIGNAL: true",
    );
    assert_eq!(done.status.code(), Some(exit_codes::ALLOW));

    let status = loopguard(temp.path(), &["session", "status", "--json"], "");
    let report: serde_json::Value = serde_json::from_slice(&status.stdout).expect("status json");
    assert_eq!(report["session"]["status"], "completed");
    assert_eq!(report["session"]["iteration"], 1);
}

#[test]
fn operator_errors_exit_with_error_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = loopguard(temp.path(), &["breaker", "reset"], "");
    assert_eq!(out.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&out.stderr).contains("loopguard init"));
}

#[test]
fn session_fields_are_read_and_written_by_name() {
    let temp = initialized();
    loopguard(temp.path(), &START_SESSION, "");

    let set = loopguard(temp.path(), &["session", "set", "phase", "verify"], "");
    assert_eq!(set.status.code(), Some(exit_codes::ALLOW));
    let get = loopguard(temp.path(), &["session", "get", "phase"], "");
    assert_eq!(String::from_utf8_lossy(&get.stdout).trim(), "verify");

    let invalid = loopguard(temp.path(), &["session", "set", "model_tier", "tier9"], "");
    assert_eq!(invalid.status.code(), Some(exit_codes::ERROR));
}
