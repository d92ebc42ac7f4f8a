//! Event payloads handed to a hook invocation on stdin.
//!
//! Hosts differ in field names, so the common spellings are accepted as
//! aliases. Anything that is not a JSON object is treated as free-text output.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Operation names that mutate a file in place.
const WRITE_OPERATIONS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Operation names that run a shell command.
const SHELL_OPERATIONS: &[&str] = &["Bash", "Shell", "shell", "run_command"];

/// Token and cost usage reported alongside an action result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(alias = "cost", alias = "total_cost_usd")]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HookInput {
    #[serde(alias = "tool_name", alias = "tool")]
    pub operation: Option<String>,
    #[serde(alias = "tool_input")]
    pub input: Value,
    #[serde(alias = "tool_response", alias = "tool_result")]
    pub result: Value,
    #[serde(alias = "last_assistant_message", alias = "message", alias = "text")]
    pub output: Option<String>,
    pub usage: Option<Usage>,
    pub is_error: Option<bool>,
}

impl HookInput {
    /// Parse stdin. Never fails: empty input is the default, non-JSON is output text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ Value::Object(_)) => serde_json::from_value(value).unwrap_or_else(|err| {
                debug!(err = %err, "hook input has unexpected shape; treating as text");
                Self::text(trimmed)
            }),
            Ok(Value::String(text)) => Self::text(&text),
            Ok(_) | Err(_) => Self::text(trimmed),
        }
    }

    fn text(text: &str) -> Self {
        Self {
            output: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn is_write_like(&self) -> bool {
        self.operation()
            .is_some_and(|op| WRITE_OPERATIONS.contains(&op))
    }

    /// Shell command for this action, if it is one.
    pub fn command(&self) -> Option<&str> {
        let cmd = self.input.get("command").and_then(Value::as_str)?;
        match self.operation() {
            Some(op) if !SHELL_OPERATIONS.contains(&op) => None,
            _ => Some(cmd),
        }
    }

    /// Every file path the action targets, deduplicated in input order.
    pub fn target_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        let mut push = |value: Option<&Value>| {
            if let Some(path) = value.and_then(Value::as_str)
                && !path.trim().is_empty()
                && !paths.iter().any(|p| p == path)
            {
                paths.push(path.to_string());
            }
        };
        for key in ["file_path", "path", "notebook_path"] {
            push(self.input.get(key));
        }
        if let Some(edits) = self.input.get("edits").and_then(Value::as_array) {
            for edit in edits {
                push(edit.get("file_path"));
            }
        }
        paths
    }

    /// Flattened textual result of the action.
    pub fn result_text(&self) -> String {
        match &self.result {
            Value::Null => self.output.clone().unwrap_or_default(),
            Value::String(s) => s.clone(),
            Value::Object(map) => {
                let parts: Vec<&str> = ["stdout", "stderr", "output", "content", "error"]
                    .iter()
                    .filter_map(|key| map.get(*key).and_then(Value::as_str))
                    .filter(|s| !s.is_empty())
                    .collect();
                if parts.is_empty() {
                    self.result.to_string()
                } else {
                    parts.join("\n")
                }
            }
            other => other.to_string(),
        }
    }

    /// The host's own verdict on the result, when it gives one.
    pub fn error_flag(&self) -> Option<bool> {
        if self.is_error.is_some() {
            return self.is_error;
        }
        let map = self.result.as_object()?;
        if let Some(flag) = map.get("is_error").and_then(Value::as_bool) {
            return Some(flag);
        }
        if map.get("interrupted").and_then(Value::as_bool) == Some(true) {
            return Some(true);
        }
        ["exit_code", "exitCode", "returncode"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_i64))
            .map(|code| code != 0)
    }

    /// Free-text agent output for at-exit classification.
    pub fn output_text(&self) -> &str {
        self.output.as_deref().unwrap_or("")
    }
}
