//! Engine configuration.
//!
//! Every recognized option with its default. Configuration can be built in
//! code, loaded from a YAML document, or loaded from a YAML file whose
//! string values may reference environment variables as `${VAR}` or
//! `${VAR:default}`.

use crate::model::GradingMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide configuration. Per-run inputs can override `enable_review`
/// and `grading_mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Size of the fan-out worker pool.
    pub max_parallel_workers: usize,

    /// Token budget per grading worker invocation.
    pub max_tokens_per_batch: u64,

    /// Per-LLM-call retry cap inside a worker.
    pub max_retries: u32,

    /// Rubric re-parse cap on semantic violations.
    pub max_parse_retries: u32,

    /// Per-LLM-call timeout in seconds.
    pub llm_call_timeout_s: f64,

    /// Per-node timeout in seconds.
    pub node_timeout_s: f64,

    /// End-to-end run timeout in seconds.
    pub run_timeout_s: f64,

    /// Whether rubric/results review gates are active.
    pub enable_review: bool,

    /// Default grading mode; `assist` skips gates unconditionally.
    pub grading_mode: GradingMode,

    /// Confidence assigned to synthesized fallback rubrics.
    pub fallback_rubric_confidence: f64,

    /// Per-subscriber bounded event queue size.
    pub event_buffer_size: usize,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: 4,
            max_tokens_per_batch: 12_000,
            max_retries: 2,
            max_parse_retries: 2,
            llm_call_timeout_s: 60.0,
            node_timeout_s: 300.0,
            run_timeout_s: 1_800.0,
            enable_review: true,
            grading_mode: GradingMode::Strict,
            fallback_rubric_confidence: 0.3,
            event_buffer_size: 256,
        }
    }
}

impl GradingConfig {
    pub fn llm_call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.llm_call_timeout_s)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.node_timeout_s)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run_timeout_s)
    }

    /// Parse a YAML document, expanding `${VAR}` / `${VAR:default}` in
    /// string positions before deserializing.
    pub fn from_yaml_str(raw: &str) -> Result<Self, String> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| format!("invalid YAML: {e}"))?;
        expand_variables(&mut value);
        serde_yaml::from_value(value).map_err(|e| format!("invalid configuration: {e}"))
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("failed to read {:?}: {e}", path.as_ref()))?;
        Self::from_yaml_str(&raw)
    }
}

/// Expand `${VAR}` and `${VAR:default}` in every string value.
fn expand_variables(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(expanded) = expand_one(s) {
                // Numeric-looking expansions should deserialize as numbers.
                *value = serde_yaml::from_str(&expanded)
                    .unwrap_or(serde_yaml::Value::String(expanded));
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_variables(v);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_variables(item);
            }
        }
        _ => {}
    }
}

fn expand_one(s: &str) -> Option<String> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    let (var, default) = match inner.split_once(':') {
        Some((var, default)) => (var, Some(default)),
        None => (inner, None),
    };
    match std::env::var(var) {
        Ok(value) => Some(value),
        Err(_) => default.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GradingConfig::default();
        assert_eq!(config.max_parallel_workers, 4);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.llm_call_timeout(), Duration::from_secs(60));
        assert_eq!(config.run_timeout(), Duration::from_secs(1800));
        assert!(config.enable_review);
        assert_eq!(config.grading_mode, GradingMode::Strict);
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let config = GradingConfig::from_yaml_str(
            "max_parallel_workers: 8\ngrading_mode: assist\nevent_buffer_size: 32\n",
        )
        .unwrap();
        assert_eq!(config.max_parallel_workers, 8);
        assert_eq!(config.grading_mode, GradingMode::Assist);
        assert_eq!(config.event_buffer_size, 32);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_tokens_per_batch, 12_000);
    }

    #[test]
    fn env_expansion_with_default() {
        std::env::remove_var("GRADEFLOW_TEST_WORKERS");
        let config =
            GradingConfig::from_yaml_str("max_parallel_workers: \"${GRADEFLOW_TEST_WORKERS:6}\"\n")
                .unwrap();
        assert_eq!(config.max_parallel_workers, 6);

        std::env::set_var("GRADEFLOW_TEST_WORKERS", "2");
        let config =
            GradingConfig::from_yaml_str("max_parallel_workers: \"${GRADEFLOW_TEST_WORKERS:6}\"\n")
                .unwrap();
        assert_eq!(config.max_parallel_workers, 2);
        std::env::remove_var("GRADEFLOW_TEST_WORKERS");
    }
}
