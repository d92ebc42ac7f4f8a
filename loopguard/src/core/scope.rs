//! File-scope enforcement for task mutations.
//!
//! A rule set is parsed from a rule file with one rule per line:
//!
//! - `+pattern` allow (exact path or glob)
//! - `-path` deny an exact file
//! - `!dir` deny a directory prefix
//!
//! Deny always wins. With allow rules present a path must match at least one of
//! them; with none, anything not denied is permitted.

use std::fmt;
use std::path::{Component, Path};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// A single scope rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScopeRule {
    Allow(String),
    DenyFile(String),
    DenyDir(String),
}

impl fmt::Display for ScopeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeRule::Allow(p) => write!(f, "+{p}"),
            ScopeRule::DenyFile(p) => write!(f, "-{p}"),
            ScopeRule::DenyDir(p) => write!(f, "!{p}"),
        }
    }
}

/// Ordered rule set attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRules {
    pub rules: Vec<ScopeRule>,
}

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeViolation {
    /// The path hit a deny rule.
    Denied { rule: ScopeRule },
    /// Allow rules exist and none matched.
    NotAllowed,
}

/// Verdict for one candidate path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ScopeVerdict {
    Allowed,
    Blocked {
        path: String,
        violation: ScopeViolation,
        /// The allow patterns, for telling the agent where it may write.
        allowed: Vec<String>,
    },
}

impl ScopeVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ScopeVerdict::Allowed)
    }
}

impl ScopeRules {
    /// Parse a rule file. Blank lines and `#` comments are ignored.
    ///
    /// Returns every malformed line as an error so operators can fix them in one pass.
    pub fn parse(text: &str) -> Result<Self, Vec<String>> {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut chars = line.chars();
            let prefix = chars.next();
            let value = normalize_rule_path(chars.as_str().trim());
            if value.is_empty() {
                errors.push(format!("line {}: empty rule '{}'", idx + 1, line));
                continue;
            }
            match prefix {
                Some('+') => {
                    if let Err(err) = Pattern::new(&value) {
                        errors.push(format!("line {}: invalid glob '{}': {}", idx + 1, value, err));
                        continue;
                    }
                    rules.push(ScopeRule::Allow(value));
                }
                Some('-') => rules.push(ScopeRule::DenyFile(value)),
                Some('!') => {
                    rules.push(ScopeRule::DenyDir(value.trim_end_matches('/').to_string()))
                }
                _ => errors.push(format!(
                    "line {}: rule must start with '+', '-' or '!' (got '{}')",
                    idx + 1,
                    line
                )),
            }
        }
        if errors.is_empty() {
            Ok(Self { rules })
        } else {
            Err(errors)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn allow_patterns(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter_map(|rule| match rule {
                ScopeRule::Allow(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Render back to rule-file form.
    pub fn to_rule_file(&self) -> String {
        let mut buf = String::new();
        for rule in &self.rules {
            buf.push_str(&rule.to_string());
            buf.push('\n');
        }
        buf
    }

    /// Evaluate a project-relative path. The result does not depend on rule order.
    pub fn evaluate(&self, path: &str) -> ScopeVerdict {
        let path = normalize_rule_path(path);

        let denied = self.rules.iter().find(|rule| match rule {
            ScopeRule::DenyFile(file) => path == *file,
            ScopeRule::DenyDir(dir) => is_under_dir(&path, dir),
            ScopeRule::Allow(_) => false,
        });
        if let Some(rule) = denied {
            return self.blocked(path, ScopeViolation::Denied { rule: rule.clone() });
        }

        let allow: Vec<&String> = self
            .rules
            .iter()
            .filter_map(|rule| match rule {
                ScopeRule::Allow(p) => Some(p),
                _ => None,
            })
            .collect();
        if allow.is_empty() || allow.iter().any(|pattern| allow_matches(pattern, &path)) {
            return ScopeVerdict::Allowed;
        }
        self.blocked(path, ScopeViolation::NotAllowed)
    }

    fn blocked(&self, path: String, violation: ScopeViolation) -> ScopeVerdict {
        ScopeVerdict::Blocked {
            path,
            violation,
            allowed: self.allow_patterns(),
        }
    }
}

/// Make a path relative to `root` when it lives under it, then normalize.
pub fn relativize(root: &Path, path: &str) -> String {
    let candidate = Path::new(path);
    if candidate.is_absolute()
        && let Ok(rel) = candidate.strip_prefix(root)
    {
        return normalize_rule_path(&rel.to_string_lossy());
    }
    normalize_rule_path(path)
}

/// Normalize separators and resolve `.`/`..` lexically so `a/../secrets` cannot
/// slip past a `!secrets` rule.
fn normalize_rule_path(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..".to_string());
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Directory-prefix match with an explicit separator boundary.
fn is_under_dir(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn allow_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    if !pattern.contains(['*', '?', '[']) {
        return false;
    }
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    Pattern::new(pattern).is_ok_and(|compiled| compiled.matches_with(path, options))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(text: &str) -> ScopeRules {
        ScopeRules::parse(text).expect("parse rules")
    }

    #[test]
    fn deny_beats_allow_for_nested_paths() {
        let scope = rules("+api/**\n!api/secrets\n");
        assert!(!scope.evaluate("api/secrets/key.txt").is_allowed());
        assert!(scope.evaluate("api/routes.go").is_allowed());
        assert!(!scope.evaluate("apiextra.go").is_allowed());
    }

    #[test]
    fn deny_result_is_independent_of_rule_order() {
        let forward = rules("+api/**\n!api/secrets\n");
        let reversed = rules("!api/secrets\n+api/**\n");
        for path in ["api/secrets/key.txt", "api/routes.go", "apiextra.go"] {
            assert_eq!(
                forward.evaluate(path).is_allowed(),
                reversed.evaluate(path).is_allowed(),
                "{path}"
            );
        }
    }

    #[test]
    fn dir_prefix_requires_separator_boundary() {
        let scope = rules("!src\n");
        assert!(!scope.evaluate("src/foo.txt").is_allowed());
        assert!(scope.evaluate("srcfile.txt").is_allowed());
        assert!(!scope.evaluate("src").is_allowed());
    }

    #[test]
    fn deny_file_is_exact() {
        let scope = rules("-config/prod.toml\n");
        assert!(!scope.evaluate("config/prod.toml").is_allowed());
        assert!(scope.evaluate("config/prod.toml.bak").is_allowed());
    }

    #[test]
    fn empty_rules_permit_everything() {
        let scope = ScopeRules::default();
        assert!(scope.evaluate("anything/at/all.rs").is_allowed());
    }

    #[test]
    fn parent_segments_cannot_escape_denied_dir() {
        let scope = rules("!secrets\n");
        assert!(!scope.evaluate("docs/../secrets/key").is_allowed());
        assert!(!scope.evaluate("./secrets/key").is_allowed());
    }

    #[test]
    fn blocked_verdict_reports_rule_and_allowed_set() {
        let scope = rules("+src/*.rs\n!src/generated\n");
        let verdict = scope.evaluate("src/generated/out.rs");
        assert_eq!(
            verdict,
            ScopeVerdict::Blocked {
                path: "src/generated/out.rs".to_string(),
                violation: ScopeViolation::Denied {
                    rule: ScopeRule::DenyDir("src/generated".to_string())
                },
                allowed: vec!["src/*.rs".to_string()],
            }
        );
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let scope = rules("+src/*.rs\n");
        assert!(scope.evaluate("src/lib.rs").is_allowed());
        assert!(!scope.evaluate("src/core/mod.rs").is_allowed());
    }

    #[test]
    fn parse_skips_comments_and_reports_bad_lines() {
        let errors = ScopeRules::parse("# comment\n\n+ok/**\nbad line\n+\n").expect_err("errors");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("line 4"));
        assert!(errors[1].contains("line 5"));
    }

    #[test]
    fn relativize_strips_project_root() {
        let root = Path::new("/work/project");
        assert_eq!(relativize(root, "/work/project/src/main.rs"), "src/main.rs");
        assert_eq!(relativize(root, "./src/main.rs"), "src/main.rs");
        assert_eq!(relativize(root, "/etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn rule_file_round_trips_through_display() {
        let scope = rules("+a/**\n-b.txt\n!c\n");
        assert_eq!(scope.to_rule_file(), "+a/**\n-b.txt\n!c\n");
    }
}
