//! Scheduler configuration.
//!
//! Configuration can be loaded from JSON or YAML files, or inline JSON in the
//! `LLM_DISPATCH_CONFIG` environment variable. Everything is checked once by
//! [`SchedulerConfig::validate`]; a config that passes validation cannot make
//! the scheduler fail per request.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "LLM_DISPATCH_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "dispatch-config.json";

/// Root configuration for the dispatch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of requests per engine call
    pub batch_size: usize,

    /// Sleep between drain cycles of a batch worker, in seconds
    pub batch_interval_seconds: f64,

    /// Queue length at which `enqueue` starts rejecting (unbounded if unset)
    pub max_queue_depth: Option<usize>,

    /// Device selection strategy
    pub load_balancing_strategy: LoadBalancingStrategy,

    /// Ordered list of device ids, must be non-empty
    pub gpu_ids: Vec<u32>,

    /// Multi-device partitioning layout
    pub parallel: ParallelConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            batch_interval_seconds: 0.05,
            max_queue_depth: None,
            load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
            gpu_ids: vec![0],
            parallel: ParallelConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a JSON or YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|e| ConfigError::Io {
            path: path_ref.to_path_buf(),
            message: e.to_string(),
        })?;

        let path_str = path_ref.to_string_lossy();
        if path_str.ends_with(".yaml") || path_str.ends_with(".yml") {
            Self::from_yaml_str(&content, &path_str)
        } else {
            Self::from_json_str(&content, &path_str)
        }
    }

    pub fn from_json_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseJson {
            origin: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            origin: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Resolve configuration from the environment, an explicit path, or defaults.
    ///
    /// Checks in order:
    /// 1. `LLM_DISPATCH_CONFIG` environment variable (JSON content or file path)
    /// 2. `cli_path` (if provided)
    /// 3. `dispatch-config.json` in the current directory
    /// 4. Default configuration
    ///
    /// Unlike a missing file, a file that exists but does not parse is an error.
    pub fn load(cli_path: Option<&str>) -> Result<Self, ConfigError> {
        if let Ok(env_value) = std::env::var(CONFIG_ENV_VAR) {
            if env_value.trim().starts_with('{') {
                tracing::info!("Loaded scheduler config from {CONFIG_ENV_VAR} env");
                return Self::from_json_str(&env_value, CONFIG_ENV_VAR);
            } else if Path::new(&env_value).exists() {
                tracing::info!("Loaded scheduler config from {}", env_value);
                return Self::from_file(&env_value);
            }
            tracing::warn!(
                "{CONFIG_ENV_VAR} is set but is neither JSON nor an existing file: {}",
                env_value
            );
        }

        if let Some(path) = cli_path {
            tracing::info!("Loaded scheduler config from {}", path);
            return Self::from_file(path);
        }

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            tracing::info!("Loaded scheduler config from {DEFAULT_CONFIG_FILE}");
            return Self::from_file(DEFAULT_CONFIG_FILE);
        }

        tracing::info!("Using default scheduler configuration");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gpu_ids.is_empty() {
            return Err(ConfigError::EmptyGpuIds);
        }
        let mut seen = HashSet::new();
        for id in &self.gpu_ids {
            if !seen.insert(*id) {
                return Err(ConfigError::DuplicateGpuId(*id));
            }
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than zero"));
        }
        if !self.batch_interval_seconds.is_finite() || self.batch_interval_seconds <= 0.0 {
            return Err(ConfigError::invalid(
                "batch_interval_seconds",
                format!("must be a positive number, got {}", self.batch_interval_seconds),
            ));
        }
        if let Err(e) = Duration::try_from_secs_f64(self.batch_interval_seconds) {
            return Err(ConfigError::invalid(
                "batch_interval_seconds",
                format!("{} is not a representable duration: {e}", self.batch_interval_seconds),
            ));
        }
        if self.max_queue_depth == Some(0) {
            return Err(ConfigError::invalid(
                "max_queue_depth",
                "must be greater than zero when set",
            ));
        }
        self.parallel.validate()
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs_f64(self.batch_interval_seconds)
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval_seconds = interval.as_secs_f64();
        self
    }

    #[must_use]
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_gpu_ids(mut self, gpu_ids: Vec<u32>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }
}

/// How the load balancer picks a device for the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Adaptive,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(ConfigError::InvalidStrategy(s.to_string())),
        }
    }
}

impl TryFrom<String> for LoadBalancingStrategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LoadBalancingStrategy> for String {
    fn from(value: LoadBalancingStrategy) -> Self {
        value.as_str().to_string()
    }
}

/// How one logical request is spread over several devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismStrategy {
    /// Split weight matrices along the output dimension
    Tensor,
    /// Split the ordered stage list into contiguous groups
    Pipeline,
    /// Whole batches go to a single device picked by the load balancer
    #[default]
    Data,
    /// Tensor groups inside pipeline stages
    Hybrid,
}

/// Partitioning layout for multi-device execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub strategy: ParallelismStrategy,

    /// Number of shards per weight matrix
    pub tensor_parallel_size: usize,

    /// Number of stage groups
    pub pipeline_parallel_size: usize,

    /// Fraction of each device's memory the engine may use
    pub memory_fraction: f64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            strategy: ParallelismStrategy::Data,
            tensor_parallel_size: 2,
            pipeline_parallel_size: 2,
            memory_fraction: 0.9,
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tensor_parallel_size == 0 {
            return Err(ConfigError::invalid(
                "parallel.tensor_parallel_size",
                "must be greater than zero",
            ));
        }
        if self.pipeline_parallel_size == 0 {
            return Err(ConfigError::invalid(
                "parallel.pipeline_parallel_size",
                "must be greater than zero",
            ));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "parallel.memory_fraction",
                format!("must be in (0, 1], got {}", self.memory_fraction),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.batch_interval(), Duration::from_millis(50));
        assert_eq!(config.max_queue_depth, None);
        assert_eq!(config.load_balancing_strategy, LoadBalancingStrategy::RoundRobin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "batch_size": 8,
            "batch_interval_seconds": 0.01,
            "max_queue_depth": 64,
            "load_balancing_strategy": "least_loaded",
            "gpu_ids": [2, 0, 1],
            "parallel": { "strategy": "tensor", "tensor_parallel_size": 3 }
        }"#;

        let config = SchedulerConfig::from_json_str(json, "test").unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.max_queue_depth, Some(64));
        assert_eq!(config.load_balancing_strategy, LoadBalancingStrategy::LeastLoaded);
        assert_eq!(config.gpu_ids, vec![2, 0, 1]);
        assert_eq!(config.parallel.strategy, ParallelismStrategy::Tensor);
        assert_eq!(config.parallel.tensor_parallel_size, 3);
        assert_eq!(config.parallel.pipeline_parallel_size, 2);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = "batch_size: 2\nload_balancing_strategy: adaptive\ngpu_ids: [0, 1]\n";
        let config = SchedulerConfig::from_yaml_str(yaml, "test.yaml").unwrap();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.load_balancing_strategy, LoadBalancingStrategy::Adaptive);
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let json = r#"{ "load_balancing_strategy": "random" }"#;
        let err = SchedulerConfig::from_json_str(json, "test").unwrap_err();
        assert!(matches!(err, ConfigError::ParseJson { .. }));
        assert!(err.to_string().contains("random"));

        let err = "fastest".parse::<LoadBalancingStrategy>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStrategy(s) if s == "fastest"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty = SchedulerConfig::default().with_gpu_ids(vec![]);
        assert!(matches!(empty.validate(), Err(ConfigError::EmptyGpuIds)));

        let dup = SchedulerConfig::default().with_gpu_ids(vec![0, 1, 0]);
        assert!(matches!(dup.validate(), Err(ConfigError::DuplicateGpuId(0))));

        let zero_batch = SchedulerConfig::default().with_batch_size(0);
        assert!(zero_batch.validate().is_err());

        let mut bad_interval = SchedulerConfig::default();
        bad_interval.batch_interval_seconds = f64::NAN;
        assert!(bad_interval.validate().is_err());

        let mut huge_interval = SchedulerConfig::default();
        huge_interval.batch_interval_seconds = 1e20;
        assert!(matches!(
            huge_interval.validate(),
            Err(ConfigError::InvalidValue { field: "batch_interval_seconds", .. })
        ));

        let zero_depth = SchedulerConfig::default().with_max_queue_depth(0);
        assert!(zero_depth.validate().is_err());

        let mut bad_fraction = SchedulerConfig::default();
        bad_fraction.parallel.memory_fraction = 1.5;
        assert!(bad_fraction.validate().is_err());
    }

    #[test]
    fn test_strategy_round_trips_through_string() {
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::LeastLoaded,
            LoadBalancingStrategy::Adaptive,
        ] {
            let s: String = strategy.into();
            assert_eq!(s.parse::<LoadBalancingStrategy>().unwrap(), strategy);
        }
    }
}
