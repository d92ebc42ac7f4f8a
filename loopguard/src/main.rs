//! Persistent control loop for autonomous agent sessions.
//!
//! Hooks (`loopguard hook <event>`) are invoked by the agent host and answer
//! through their exit code. Every other command is for the operator.

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use loopguard::checkpoint::CheckpointManager;
use loopguard::core::scope::{ScopeRules, ScopeVerdict, ScopeViolation};
use loopguard::core::types::{ExecutionMode, HookEvent, SessionStatus};
use loopguard::dispatch::run_hook;
use loopguard::exit_codes;
use loopguard::io::config::load_config;
use loopguard::io::init::{InitOptions, StatePaths, init_state, project_root};
use loopguard::io::accessor::Accessor;
use loopguard::io::store::{SessionField, Store};
use loopguard::logging;
use loopguard::session::{self, NewTask, StartSession};
use loopguard::session_context::SessionContext;

#[derive(Parser, Debug)]
#[command(
    name = "loopguard",
    version,
    about = "Persistent control loop for autonomous agent sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create `.loopguard/` with default config and an empty store.
    Init {
        /// Rewrite config and ignore files. The store is kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Handle one host lifecycle event. Reads the event payload on stdin.
    Hook {
        #[arg(value_enum)]
        event: HookArg,
    },
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Scope(ScopeCommand),
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
    #[command(subcommand)]
    Breaker(BreakerCommand),
    /// Toggle autonomous mode (exit blocking).
    Autonomous {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Start a session. Fails while another session is live.
    Start {
        /// What the session is for.
        #[arg(required = true)]
        command: Vec<String>,
        #[arg(long, value_enum, default_value_t = ModeArg::Normal)]
        mode: ModeArg,
        /// Override `max_iterations` from config.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// End the live session.
    End {
        #[arg(long, value_enum, default_value_t = EndStatus::Completed)]
        status: EndStatus,
    },
    /// Show the current session, tasks, and breaker.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print one field of the latest session. Prints nothing without a store.
    Get {
        #[arg(value_parser = parse_session_field)]
        field: SessionField,
    },
    /// Overwrite one field of the live session.
    Set {
        #[arg(value_parser = parse_session_field)]
        field: SessionField,
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Add a pending task to the live session.
    Add {
        title: String,
        #[arg(long)]
        id: Option<String>,
        #[command(flatten)]
        rules: RuleArgs,
        /// Task ids that must complete first.
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// Start a task once its dependencies are complete.
    Start { id: String },
    /// Complete the running task.
    Complete { id: String },
    /// Mark a task failed.
    Fail {
        id: String,
        #[arg(long, default_value = "failed by operator")]
        reason: String,
    },
    /// Replace a task's scope rules.
    Scope {
        id: String,
        #[command(flatten)]
        rules: RuleArgs,
        /// Allow replacing the scope of a running task.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct RuleArgs {
    /// Rule line: `+glob` allow, `-glob` deny file, `!glob` deny directory.
    #[arg(long = "rule", allow_hyphen_values = true)]
    rules: Vec<String>,
    /// Read rules from a rule file.
    #[arg(long)]
    rules_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ScopeCommand {
    /// Check whether a path is writable under a task's scope.
    Check {
        path: String,
        /// Task to check against (default: the active task).
        #[arg(long)]
        task: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    /// Snapshot the current loop state.
    Save {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// List checkpoints, newest first.
    List,
    /// Restore loop state from a checkpoint.
    Restore { id: String },
}

#[derive(Subcommand, Debug)]
enum BreakerCommand {
    Status,
    /// Close the breaker and resume an aborted session.
    Reset,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum HookArg {
    BeforeAction,
    AfterAction,
    AtExit,
    PreTruncation,
}

impl From<HookArg> for HookEvent {
    fn from(arg: HookArg) -> Self {
        match arg {
            HookArg::BeforeAction => HookEvent::BeforeAction,
            HookArg::AfterAction => HookEvent::AfterAction,
            HookArg::AtExit => HookEvent::AtExit,
            HookArg::PreTruncation => HookEvent::PreTruncation,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeArg {
    Normal,
    Eco,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum EndStatus {
    Completed,
    Failed,
    Aborted,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Toggle {
    On,
    Off,
}

fn main() {
    let cli = Cli::parse();
    if !matches!(cli.command, Command::Hook { .. }) {
        logging::init(None);
    }
    if let Err(err) = run(cli.command) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::ERROR);
    }
}

/// Hooks never fail closed: any internal error exits with [`exit_codes::ERROR`],
/// which hosts treat as allow.
fn hook(event: HookEvent) -> i32 {
    let paths = match project_root() {
        Ok(root) => StatePaths::new(root),
        Err(err) => {
            eprintln!("loopguard: {:#}", err);
            return exit_codes::ERROR;
        }
    };
    if paths.is_initialized() {
        logging::init(Some(&paths.log_path));
    }

    let mut raw = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut raw) {
        tracing::warn!(err = %err, "hook input unreadable; continuing with empty input");
        raw.clear();
    }

    match run_hook(paths, event, &raw) {
        Ok(response) => {
            if let Some(guidance) = &response.guidance {
                if response.is_blocked() {
                    eprintln!("{guidance}");
                } else {
                    println!("{guidance}");
                }
            }
            response.exit_code()
        }
        Err(err) => {
            tracing::error!(err = format!("{err:#}"), "hook failed");
            exit_codes::ERROR
        }
    }
}

fn run(command: Command) -> Result<()> {
    let paths = StatePaths::new(project_root()?);
    match command {
        Command::Init { force } => {
            let paths = init_state(&paths.root, &InitOptions { force })?;
            println!("initialized {}", paths.state_dir.display());
            Ok(())
        }
        Command::Hook { event } => std::process::exit(hook(event.into())),
        Command::Session(cmd) => cmd_session(&paths, cmd),
        Command::Task(cmd) => cmd_task(&paths, cmd),
        Command::Scope(ScopeCommand::Check { path, task }) => {
            let store = open_store(&paths)?;
            let (task, verdict) =
                session::check_scope(&store, &paths.root, &path, task.as_deref())?;
            print_verdict(&task.id, &verdict);
            Ok(())
        }
        Command::Checkpoint(cmd) => cmd_checkpoint(&paths, cmd),
        Command::Breaker(BreakerCommand::Status) => {
            require_initialized(&paths)?;
            let ctx = SessionContext::load(paths);
            print_json(&ctx.breaker)
        }
        Command::Breaker(BreakerCommand::Reset) => {
            let store = open_store(&paths)?;
            let config = load_config(&paths.config_path)?;
            let snapshot = session::reset_breaker(&store, &paths, &config)?;
            println!("breaker {}", snapshot.state.as_str());
            Ok(())
        }
        Command::Autonomous { state } => {
            let store = open_store(&paths)?;
            let enabled = state == Toggle::On;
            session::set_autonomous_mode(Some(&store), &paths, enabled)?;
            println!("autonomous {}", if enabled { "on" } else { "off" });
            Ok(())
        }
    }
}

fn cmd_session(paths: &StatePaths, cmd: SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::Start {
            command,
            mode,
            max_iterations,
        } => {
            let store = open_store(paths)?;
            let config = load_config(&paths.config_path)?;
            let mode = match mode {
                ModeArg::Normal => ExecutionMode::Normal,
                ModeArg::Eco => ExecutionMode::Eco,
            };
            let session = session::start_session(
                &store,
                paths,
                &config,
                &StartSession {
                    command: command.join(" "),
                    mode,
                    max_iterations,
                },
            )?;
            println!("{}", session.id);
        }
        SessionCommand::End { status } => {
            let store = open_store(paths)?;
            let status = match status {
                EndStatus::Completed => SessionStatus::Completed,
                EndStatus::Failed => SessionStatus::Failed,
                EndStatus::Aborted => SessionStatus::Aborted,
            };
            let session = session::end_session(&store, status)?;
            println!("{} {}", session.id, session.status.as_str());
        }
        SessionCommand::Status { json } => {
            let store = open_store(paths)?;
            let config = load_config(&paths.config_path)?;
            let report = session::session_status(&store, paths, &config)?;
            if json {
                return print_json(&report);
            }
            match &report.session {
                Some(s) => println!(
                    "session {} [{}] tier {} iteration {}/{} failures {}",
                    s.id,
                    s.status.as_str(),
                    config.tiers.name(s.model_tier),
                    s.iteration,
                    s.max_iterations,
                    s.consecutive_failures
                ),
                None => println!("no session"),
            }
            println!(
                "breaker {} ({}/{}) autonomous {}",
                report.breaker.state.as_str(),
                report.breaker.consecutive_failures,
                report.breaker.threshold,
                if report.autonomous { "on" } else { "off" }
            );
            for task in &report.tasks {
                println!(
                    "  {} [{} / {}] {}",
                    task.id,
                    task.status.as_str(),
                    task.attempt_state.as_str(),
                    task.title
                );
            }
        }
        SessionCommand::Get { field } => {
            let ctx = SessionContext::load(paths.clone());
            if let Some(value) = session::read_session_field(ctx.accessor(), field) {
                println!("{}", value.as_text());
            }
        }
        SessionCommand::Set { field, value } => {
            let accessor = Accessor::from_store(open_store(paths)?);
            let value = session::write_session_field(&accessor, field, &value)?;
            println!("{} {}", field.column(), value.as_text());
        }
    }
    Ok(())
}

fn cmd_task(paths: &StatePaths, cmd: TaskCommand) -> Result<()> {
    let store = open_store(paths)?;
    let task = match cmd {
        TaskCommand::Add {
            title,
            id,
            rules,
            depends_on,
        } => session::add_task(
            &store,
            NewTask {
                id,
                title,
                scope: rules.load()?,
                depends_on,
            },
        )?,
        TaskCommand::Start { id } => session::start_task(&store, &id)?,
        TaskCommand::Complete { id } => session::complete_task(&store, &id)?,
        TaskCommand::Fail { id, reason } => session::fail_task(&store, &id, &reason)?,
        TaskCommand::Scope { id, rules, force } => {
            session::set_task_scope(&store, &id, rules.load()?, force)?
        }
    };
    println!("{} {}", task.id, task.status.as_str());
    Ok(())
}

fn cmd_checkpoint(paths: &StatePaths, cmd: CheckpointCommand) -> Result<()> {
    require_initialized(paths)?;
    let ctx = SessionContext::load(paths.clone());
    let manager = CheckpointManager::new(&ctx.paths, ctx.accessor());
    match cmd {
        CheckpointCommand::Save { reason } => {
            let checkpoint = manager.save(ctx.snapshot(&reason))?;
            println!("{}", checkpoint.id);
        }
        CheckpointCommand::List => {
            for checkpoint in manager.list() {
                println!(
                    "{} {} iteration {} {}",
                    checkpoint.id,
                    checkpoint.created_at,
                    checkpoint.payload.iteration,
                    checkpoint.payload.reason
                );
            }
        }
        CheckpointCommand::Restore { id } => {
            let checkpoint = manager.restore(&id)?;
            println!("restored {}", checkpoint.id);
        }
    }
    Ok(())
}

impl RuleArgs {
    fn load(&self) -> Result<ScopeRules> {
        let mut text = String::new();
        if let Some(path) = &self.rules_file {
            text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            text.push('\n');
        }
        for rule in &self.rules {
            text.push_str(rule);
            text.push('\n');
        }
        let rules = ScopeRules::parse(&text);
        rules.map_err(|errors| anyhow!("invalid scope rules:\n{}", errors.join("\n")))
    }
}

fn parse_session_field(raw: &str) -> Result<SessionField, String> {
    SessionField::parse(raw).ok_or_else(|| format!("unknown session field `{raw}`"))
}

fn require_initialized(paths: &StatePaths) -> Result<()> {
    if !paths.is_initialized() {
        bail!(
            "{} is not initialized; run `loopguard init`",
            paths.root.display()
        );
    }
    Ok(())
}

fn open_store(paths: &StatePaths) -> Result<Store> {
    require_initialized(paths)?;
    let config = load_config(&paths.config_path)?;
    Store::open(&paths.db_path, &config.store)
}

fn print_verdict(task_id: &str, verdict: &ScopeVerdict) {
    match verdict {
        ScopeVerdict::Allowed => println!("allowed by task {task_id}"),
        ScopeVerdict::Blocked {
            path,
            violation,
            allowed,
        } => {
            match violation {
                ScopeViolation::Denied { rule } => {
                    println!("blocked: {path} matches `{rule}` in task {task_id}");
                }
                ScopeViolation::NotAllowed => {
                    println!("blocked: {path} is outside task {task_id}");
                }
            }
            for pattern in allowed {
                println!("  allowed: {pattern}");
            }
        }
    }
}

/// Print `value` as pretty JSON.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_events_parse_in_kebab_case() {
        let cli = Cli::parse_from(["loopguard", "hook", "pre-truncation"]);
        assert!(matches!(
            cli.command,
            Command::Hook {
                event: HookArg::PreTruncation
            }
        ));
        assert!(Cli::try_parse_from(["loopguard", "hook", "on-stop"]).is_err());
    }

    #[test]
    fn task_rules_accept_leading_signs() {
        let cli = Cli::parse_from([
            "loopguard", "task", "add", "api work", "--rule", "+api/**", "--rule", "-api/keys.txt",
            "--depends-on", "t0",
        ]);
        let Command::Task(TaskCommand::Add {
            rules, depends_on, ..
        }) = cli.command
        else {
            panic!("expected task add");
        };
        let scope = rules.load().expect("rules");
        assert_eq!(scope.rules.len(), 2);
        assert_eq!(depends_on, vec!["t0".to_string()]);
    }

    #[test]
    fn session_start_joins_command_words() {
        let cli = Cli::parse_from([
            "loopguard", "session", "start", "--mode", "eco", "fix", "the", "build",
        ]);
        let Command::Session(SessionCommand::Start { command, mode, .. }) = cli.command else {
            panic!("expected session start");
        };
        assert_eq!(command.join(" "), "fix the build");
        assert_eq!(mode, ModeArg::Eco);
    }

    #[test]
    fn session_fields_parse_by_column_name() {
        let cli = Cli::parse_from(["loopguard", "session", "set", "max_iterations", "40"]);
        let Command::Session(SessionCommand::Set { field, value }) = cli.command else {
            panic!("expected session set");
        };
        assert_eq!(field, SessionField::MaxIterations);
        assert_eq!(value, "40");
        assert!(Cli::try_parse_from(["loopguard", "session", "get", "created_at"]).is_err());
    }
}
