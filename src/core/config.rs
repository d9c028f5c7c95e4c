//! Engine configuration
//!
//! Loaded from TOML; every key is optional:
//!
//! ```toml
//! [cache]
//! rule_ttl_secs = 300
//! ttl_mode = "shared"        # or "per_subject"
//!
//! [evaluation]
//! record_ttl_secs = 300
//! max_condition_depth = 32
//!
//! [audit]
//! mode = "inline"            # or "background"
//! max_retries = 3
//! retry_backoff_ms = 50
//! spill_path = "audit-spill.jsonl"   # background mode only, unset by default
//! ```

use crate::core::audit::RetryPolicy;
use crate::core::error::{Result, RuleError};
use crate::core::rules::{TtlMode, DEFAULT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub evaluation: EvaluationConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Freshness window of cached rule lists
    pub rule_ttl_secs: u64,
    pub ttl_mode: TtlMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            rule_ttl_secs: 300,
            ttl_mode: TtlMode::Shared,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationConfig {
    /// Lifetime stamped on persisted evaluation rows
    pub record_ttl_secs: u64,
    /// Deepest condition tree accepted at creation and evaluated at runtime
    pub max_condition_depth: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationConfig {
            record_ttl_secs: 300,
            max_condition_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// How audit records reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// Written before the access check returns
    #[default]
    Inline,
    /// Queued to a writer thread
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    pub mode: AuditMode,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// JSON-lines file receiving background records still unwritten at shutdown
    pub spill_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            mode: AuditMode::Inline,
            max_retries: 3,
            retry_backoff_ms: 50,
            spill_path: None,
        }
    }
}

impl AuditConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn rule_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.rule_ttl_secs)
    }

    pub fn record_ttl(&self) -> chrono::TimeDelta {
        i64::try_from(self.evaluation.record_ttl_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    fn check(&self) -> Result<()> {
        if self.evaluation.max_condition_depth == 0 {
            return Err(RuleError::InvalidRule(
                "evaluation.max_condition_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
