use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level engine configuration (`shardwise.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

/// Topology cache section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// A snapshot older than this is not used without a successful refresh.
    pub max_age_ms: u64,
    /// Background refresh interval.
    pub refresh_interval_ms: u64,
    /// How long the first caller waits for the initial snapshot.
    pub cold_start_grace_ms: u64,
    /// Pause between fetch attempts during cold start.
    pub cold_start_retry_ms: u64,
    /// Upper bound on one fetch from the topology source.
    pub refresh_timeout_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 30_000,
            refresh_interval_ms: 5_000,
            cold_start_grace_ms: 3_000,
            cold_start_retry_ms: 100,
            refresh_timeout_ms: 2_000,
        }
    }
}

impl TopologyConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn cold_start_grace(&self) -> Duration {
        Duration::from_millis(self.cold_start_grace_ms)
    }

    pub fn cold_start_retry(&self) -> Duration {
        Duration::from_millis(self.cold_start_retry_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

/// Fan-out execution section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum shard sub-requests in flight per query.
    pub max_parallel_shards: usize,
    /// Request deadline when the caller gives no latency budget.
    pub default_timeout_ms: u64,
    /// Timeout multiplier applied when the planner's safety override fires.
    pub safety_timeout_factor: f64,
    /// Floor for any shortened timeout.
    pub min_timeout_ms: u64,
    /// Default partial-result policy.
    pub allow_partial: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_shards: 16,
            default_timeout_ms: 5_000,
            safety_timeout_factor: 0.5,
            min_timeout_ms: 200,
            allow_partial: false,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }
}

/// Query analysis and planning section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Per-shard candidate multiplier for global top-k queries.
    pub topk_multiplier: u32,
    /// Upper bound on candidates requested from any one shard.
    pub shard_size_ceiling: usize,
    /// Fields recognised as stable partition (routing) keys.
    pub tenant_fields: Vec<String>,
    /// Field time-series indices are partitioned on.
    pub timestamp_field: String,
    /// Node this engine runs next to; enables `LOCAL_PREFERRED`.
    pub local_node: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            topk_multiplier: 10,
            shard_size_ceiling: 1_000,
            tenant_fields: vec!["tenant_id".to_string()],
            timestamp_field: "@timestamp".to_string(),
            local_node: None,
        }
    }
}

/// Adaptive feedback section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Outcomes retained per pattern.
    pub history_size: usize,
    /// Weight of the newest sample in the moving averages, in (0, 1].
    pub decay: f64,
    /// Samples required before any advice is given.
    pub min_samples: u64,
    /// Coefficient of variation under which latency counts as stable.
    pub low_variance_cv: f64,
    /// Multiplier scale applied to stable patterns, in (0, 1].
    pub multiplier_scale: f64,
    /// Failure rate above which a pattern is never scaled down.
    pub max_failure_rate: f64,
    /// Node failure rate at which the node is hinted for avoidance.
    pub node_avoid_failure_rate: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            history_size: 128,
            decay: 0.2,
            min_samples: 8,
            low_variance_cv: 0.25,
            multiplier_scale: 0.5,
            max_failure_rate: 0.05,
            node_avoid_failure_rate: 0.5,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        let t = &self.topology;
        if t.max_age_ms == 0 {
            return Err(invalid("topology.max_age_ms", "must be > 0"));
        }
        if t.refresh_interval_ms == 0 {
            return Err(invalid("topology.refresh_interval_ms", "must be > 0"));
        }
        if t.refresh_timeout_ms == 0 {
            return Err(invalid("topology.refresh_timeout_ms", "must be > 0"));
        }
        if t.refresh_interval_ms > t.max_age_ms {
            return Err(invalid(
                "topology.refresh_interval_ms",
                format!(
                    "{} exceeds max_age_ms {}; snapshots would always go stale",
                    t.refresh_interval_ms, t.max_age_ms
                ),
            ));
        }

        let e = &self.execution;
        if e.max_parallel_shards == 0 {
            return Err(invalid("execution.max_parallel_shards", "must be > 0"));
        }
        if e.default_timeout_ms == 0 {
            return Err(invalid("execution.default_timeout_ms", "must be > 0"));
        }
        if !(e.safety_timeout_factor > 0.0 && e.safety_timeout_factor <= 1.0) {
            return Err(invalid(
                "execution.safety_timeout_factor",
                format!("{} not in (0, 1]", e.safety_timeout_factor),
            ));
        }

        let p = &self.planner;
        if p.shard_size_ceiling == 0 {
            return Err(invalid("planner.shard_size_ceiling", "must be > 0"));
        }
        if p.timestamp_field.is_empty() {
            return Err(invalid("planner.timestamp_field", "must not be empty"));
        }

        let f = &self.feedback;
        if f.history_size == 0 {
            return Err(invalid("feedback.history_size", "must be > 0"));
        }
        for (field, v) in [
            ("feedback.decay", f.decay),
            ("feedback.multiplier_scale", f.multiplier_scale),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(invalid(field, format!("{} not in (0, 1]", v)));
            }
        }
        for (field, v) in [
            ("feedback.max_failure_rate", f.max_failure_rate),
            ("feedback.node_avoid_failure_rate", f.node_avoid_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(invalid(field, format!("{} not in [0, 1]", v)));
            }
        }
        if f.low_variance_cv < 0.0 {
            return Err(invalid("feedback.low_variance_cv", "must be >= 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.topology.max_age(), Duration::from_secs(30));
        assert_eq!(config.execution.max_parallel_shards, 16);
        assert_eq!(config.planner.topk_multiplier, 10);
        assert_eq!(config.feedback.history_size, 128);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [execution]
            allow_partial = true
            max_parallel_shards = 4

            [planner]
            tenant_fields = ["customer_id", "tenant_id"]
            "#,
        )
        .unwrap();
        assert!(config.execution.allow_partial);
        assert_eq!(config.execution.max_parallel_shards, 4);
        assert_eq!(config.execution.default_timeout_ms, 5_000);
        assert_eq!(config.planner.tenant_fields.len(), 2);
        assert_eq!(config.planner.timestamp_field, "@timestamp");
        assert_eq!(config.topology, TopologyConfig::default());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = EngineConfig::from_toml_str("[feedback]\ndecay = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "feedback.decay", .. }));

        let err = EngineConfig::from_toml_str(
            "[topology]\nmax_age_ms = 1000\nrefresh_interval_ms = 2000\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "topology.refresh_interval_ms",
                ..
            }
        ));

        let err = EngineConfig::from_toml_str("[topology]\nrefresh_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "topology.refresh_timeout_ms",
                ..
            }
        ));

        let err = EngineConfig::from_toml_str("[execution\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let mut config = EngineConfig::default();
        config.planner.local_node = Some("node-a".into());
        let text = config.to_toml_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let loaded = EngineConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::load("/nonexistent/shardwise.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
