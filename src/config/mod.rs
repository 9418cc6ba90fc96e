//! Configuration module for satflow
//!
//! A pipeline is described by a TOML file: global protocol settings plus an
//! ordered list of stages. Stage settings are opaque to the core; they are
//! handed to the stage factory registered for the stage's `kind`.
//!
//! # Example
//!
//! ```toml
//! name = "l2-chain"
//! use_lock = true
//! poll_timeout_ms = 1000
//! baton_timeout_ms = 60000
//!
//! [[stages]]
//! name = "splitter"
//! kind = "split"
//! [stages.settings]
//! separator = ","
//!
//! [[stages]]
//! name = "writer"
//! kind = "passthrough"
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, ResultExt, SatflowError};
use crate::pipeline::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default queue poll timeout in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

/// Default retry interval while a worker has no input queue
pub const DEFAULT_IDLE_RETRY_MS: u64 = 100;

/// Default deadline for a single baton wait
pub const DEFAULT_BATON_TIMEOUT_MS: u64 = 60_000;

/// Configuration for one stage of the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique name within the pipeline, used for logging and baton names
    pub name: String,

    /// Stage kind, looked up in the stage registry
    pub kind: String,

    /// Stage-specific settings
    #[serde(default)]
    pub settings: BTreeMap<String, ConfigValue>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            settings: BTreeMap::new(),
        }
    }

    /// Builder-style setting insertion
    pub fn with_setting(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.settings.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ConfigValue::as_int)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(ConfigValue::as_bool)
    }
}

/// Whole-pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name (logging only)
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Strict per-item ordering via the baton protocol
    #[serde(default)]
    pub use_lock: bool,

    /// Input queue poll timeout; bounds shutdown latency
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Deadline for one baton wait. 0 waits until stopped.
    #[serde(default = "default_baton_timeout_ms")]
    pub baton_timeout_ms: u64,

    /// Retry interval while no input queue is wired
    #[serde(default = "default_idle_retry_ms")]
    pub idle_retry_ms: u64,

    /// Stages in chain order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn default_pipeline_name() -> String {
    "satflow".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_baton_timeout_ms() -> u64 {
    DEFAULT_BATON_TIMEOUT_MS
}

fn default_idle_retry_ms() -> u64 {
    DEFAULT_IDLE_RETRY_MS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            use_lock: false,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            baton_timeout_ms: DEFAULT_BATON_TIMEOUT_MS,
            idle_retry_ms: DEFAULT_IDLE_RETRY_MS,
            stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style stage append
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Saved pipeline config to {:?}", path);
        Ok(())
    }

    /// Check the invariants the runtime relies on
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(SatflowError::Config("no stages configured".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(SatflowError::Config(
                "poll_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(SatflowError::Config("stage with empty name".to_string()));
            }
            if stage.kind.trim().is_empty() {
                return Err(SatflowError::Config(format!(
                    "stage '{}' has no kind",
                    stage.name
                )));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(SatflowError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Runtime settings shared by every worker of this pipeline
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            use_lock: self.use_lock,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            baton_timeout: (self.baton_timeout_ms > 0)
                .then(|| Duration::from_millis(self.baton_timeout_ms)),
            idle_retry: Duration::from_millis(self.idle_retry_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "l2-chain"
use_lock = true
poll_timeout_ms = 250

[[stages]]
name = "splitter"
kind = "split"
[stages.settings]
separator = ","

[[stages]]
name = "copies"
kind = "repeat"
[stages.settings]
count = 3
"#;

    #[test]
    fn test_parse_sample() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.name, "l2-chain");
        assert!(config.use_lock);
        assert_eq!(config.poll_timeout_ms, 250);
        assert_eq!(config.baton_timeout_ms, DEFAULT_BATON_TIMEOUT_MS);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].get_str("separator"), Some(","));
        assert_eq!(config.stages[1].get_int("count"), Some(3));
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(!config.use_lock);
        assert_eq!(config.poll_timeout_ms, DEFAULT_POLL_TIMEOUT_MS);
        assert_eq!(config.idle_retry_ms, DEFAULT_IDLE_RETRY_MS);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = PipelineConfig::new("dup")
            .with_stage(StageConfig::new("a", "passthrough"))
            .with_stage(StageConfig::new("a", "passthrough"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn test_validate_rejects_empty_pipeline() {
        assert!(PipelineConfig::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_poll_timeout() {
        let mut config =
            PipelineConfig::new("zero").with_stage(StageConfig::new("a", "passthrough"));
        config.poll_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_settings() {
        let mut config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        config.baton_timeout_ms = 0;
        let settings = config.worker_settings();
        assert!(settings.use_lock);
        assert_eq!(settings.poll_timeout, Duration::from_millis(250));
        assert_eq!(settings.baton_timeout, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = PipelineConfig::load("/nonexistent/pipeline.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
