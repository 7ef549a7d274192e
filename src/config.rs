// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Defaults are usable out of the box. A YAML file can override any field,
//! and `KINETIC_FLOW_*` environment variables override both.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DefinitionError;

/// Tunables for one `Engine`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on concurrently launched children of a parallel iterate step
    pub max_concurrency: usize,
    /// Timeout applied to externally-executed steps without their own `timeout`
    pub default_action_timeout_secs: u64,
    /// Wall-clock budget for a single expression evaluation
    pub expression_timeout_ms: u64,
    /// Maximum AST depth an expression may reach while evaluating
    pub max_expression_depth: usize,
    /// Maximum number of evaluation steps in a single expression
    pub max_expression_steps: u64,
    /// Maximum nesting of step lists (branches, iteration bodies)
    pub max_nesting_depth: usize,
    pub definition_cache_capacity: usize,
    pub definition_cache_ttl_secs: u64,
    /// In-memory pending action entries kept for fast lookup
    pub pending_capacity: usize,
    /// Environment variables visible to `env()`; `None` allows every variable
    pub env_allowlist: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_action_timeout_secs: 3600,
            expression_timeout_ms: 5000,
            max_expression_depth: 64,
            max_expression_steps: 1_000_000,
            max_nesting_depth: 16,
            definition_cache_capacity: 64,
            definition_cache_ttl_secs: 300,
            pending_capacity: 1024,
            env_allowlist: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file, then apply env overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Ok(config.with_env_overrides())
    }

    /// Defaults with env overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_number("KINETIC_FLOW_MAX_CONCURRENCY") {
            self.max_concurrency = v as usize;
        }
        if let Some(v) = env_number("KINETIC_FLOW_ACTION_TIMEOUT_SECS") {
            self.default_action_timeout_secs = v;
        }
        if let Some(v) = env_number("KINETIC_FLOW_EXPRESSION_TIMEOUT_MS") {
            self.expression_timeout_ms = v;
        }
        if let Some(v) = env_number("KINETIC_FLOW_CACHE_TTL_SECS") {
            self.definition_cache_ttl_secs = v;
        }
        if let Ok(list) = std::env::var("KINETIC_FLOW_ENV_ALLOWLIST") {
            self.env_allowlist = Some(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        self
    }

    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression_timeout_ms)
    }

    pub fn definition_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.definition_cache_ttl_secs)
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={}: not a number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.expression_timeout(), Duration::from_secs(5));
        assert!(config.env_allowlist.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: EngineConfig = serde_yaml::from_str("max_concurrency: 3\n").unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.default_action_timeout_secs, 3600);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "pending_capacity: 8\nenv_allowlist: [HOME]\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.pending_capacity, 8);
        assert_eq!(config.env_allowlist, Some(vec!["HOME".to_string()]));
    }
}
