//! Loop configuration stored under `.loopguard/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::breaker::BreakerPolicy;
use crate::core::types::ModelTier;

/// Control-loop configuration (TOML).
///
/// Edited by humans; missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Blocked exit attempts allowed before exit is forced through.
    pub max_iterations: u32,

    /// Consecutive gate failures that trip the circuit breaker.
    pub max_failures: u32,

    pub escalation_threshold_normal: u32,
    pub escalation_threshold_eco: u32,

    /// Fraction of a ceiling at which before-action starts warning.
    pub warn_ratio: f64,

    /// Branches that must never be force-pushed.
    pub protected_branches: Vec<String>,

    /// Completion markers accepted on top of the built-in ones.
    pub completion_markers: Vec<String>,

    pub store: StoreConfig,
    pub subcheck: SubcheckConfig,
    pub scope: ScopeConfig,
    pub tiers: TierNames,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    /// Attempts after the first when SQLite reports contention.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 250,
            retry_attempts: 3,
            retry_backoff_ms: 25,
        }
    }
}

/// Budget for checks that shell out (git lookups).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubcheckConfig {
    pub timeout_ms: u64,
}

impl Default for SubcheckConfig {
    fn default() -> Self {
        Self { timeout_ms: 500 }
    }
}

impl SubcheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What an edit-time scope violation does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EditCheck {
    /// Block the write.
    #[default]
    Enforce,
    /// Allow the write with a warning; the commit-time check still blocks.
    Advisory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ScopeConfig {
    pub edit_check: EditCheck,
}

/// Human-facing names for each rung of the escalation ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierNames {
    pub tier1: String,
    pub tier2: String,
    pub tier3: String,
    pub diagnostic: String,
}

impl Default for TierNames {
    fn default() -> Self {
        Self {
            tier1: "fast".to_string(),
            tier2: "balanced".to_string(),
            tier3: "deep".to_string(),
            diagnostic: "diagnostic council".to_string(),
        }
    }
}

impl TierNames {
    pub fn name(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Tier1 => &self.tier1,
            ModelTier::Tier2 => &self.tier2,
            ModelTier::Tier3 => &self.tier3,
            ModelTier::Diagnostic => &self.diagnostic,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_failures: 5,
            escalation_threshold_normal: 2,
            escalation_threshold_eco: 4,
            warn_ratio: 0.8,
            protected_branches: vec!["main".to_string(), "master".to_string()],
            completion_markers: Vec::new(),
            store: StoreConfig::default(),
            subcheck: SubcheckConfig::default(),
            scope: ScopeConfig::default(),
            tiers: TierNames::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_failures == 0 {
            return Err(anyhow!("max_failures must be > 0"));
        }
        if self.escalation_threshold_normal == 0 || self.escalation_threshold_eco == 0 {
            return Err(anyhow!("escalation thresholds must be > 0"));
        }
        if !(self.warn_ratio > 0.0 && self.warn_ratio <= 1.0) {
            return Err(anyhow!("warn_ratio must be in (0, 1]"));
        }
        if self.subcheck.timeout_ms == 0 {
            return Err(anyhow!("subcheck.timeout_ms must be > 0"));
        }
        if self.protected_branches.iter().any(|b| b.trim().is_empty()) {
            return Err(anyhow!("protected_branches must not contain empty names"));
        }
        Ok(())
    }

    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            normal_threshold: self.escalation_threshold_normal,
            eco_threshold: self.escalation_threshold_eco,
            max_failures: self.max_failures,
        }
    }

    /// True once `value` has reached the warning fraction of `ceiling`.
    pub fn near_ceiling(&self, value: u32, ceiling: u32) -> bool {
        ceiling > 0 && f64::from(value) >= f64::from(ceiling) * self.warn_ratio
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = LoopConfig {
            max_iterations: 7,
            completion_markers: vec!["SHIP IT".to_string()],
            ..LoopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_failures = 3\n[scope]\nedit_check = \"advisory\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_failures, 3);
        assert_eq!(cfg.scope.edit_check, EditCheck::Advisory);
        assert_eq!(cfg.max_iterations, 20);
        assert_eq!(cfg.store.retry_attempts, 3);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cfg = LoopConfig {
            warn_ratio: 1.5,
            ..LoopConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("warn_ratio"));
    }

    #[test]
    fn warns_at_configured_fraction() {
        let cfg = LoopConfig::default();
        assert!(!cfg.near_ceiling(15, 20));
        assert!(cfg.near_ceiling(16, 20));
        assert!(!cfg.near_ceiling(0, 0));
    }
}
