//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Blueprints may override `max_parallel`, `failure_policy` and `budget`
//! for a single run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetLimits;
use crate::error::EngineError;
use crate::models::FailurePolicy;

/// Tuning knobs for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent leaf executions across the whole run, nested workflows included.
    pub max_parallel: usize,
    /// Maximum number of times a retryable node failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Applied to nodes that do not set `timeout_ms`.
    pub default_timeout_ms: Option<u64>,
    /// Nesting bound for `workflow` nodes.
    pub max_workflow_depth: u32,
    pub failure_policy: FailurePolicy,
    /// Used when a model reports tokens but no cost.
    pub cost_per_1k_tokens: f64,
    pub budget: BudgetLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            default_timeout_ms: None,
            max_workflow_depth: 8,
            failure_policy: FailurePolicy::Halt,
            cost_per_1k_tokens: 0.0,
            budget: BudgetLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(raw)
            .map_err(|e| EngineError::invalid("<config>", e.to_string()))?;
        if config.max_parallel == 0 {
            return Err(EngineError::invalid("<config>", "max_parallel must be at least 1"));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid("<config>", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry_base_delay(), Duration::from_millis(100));
    }

    #[test]
    fn budget_table_is_parsed() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_parallel = 2
            failure_policy = "continue_possible"

            [budget]
            max_tokens = 1000
            warn_ratio = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.failure_policy, FailurePolicy::ContinuePossible);
        assert_eq!(config.budget.max_tokens, Some(1000));
        assert_eq!(config.budget.warn_ratio, 0.5);
        assert_eq!(config.budget.max_calls, None);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        assert!(EngineConfig::from_toml_str("max_parallel = 0").is_err());
    }
}
