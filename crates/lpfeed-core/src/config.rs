//! Configuration management for lpfeed
//!
//! Handles loading and validation of `lpfeed.toml` files, plus the validated
//! per-store [`StorageConfig`] that every storage engine is built from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, ValidationError};
use crate::logging::LogConfig;
use crate::pipeline::PipelineConfig;

// =============================================================================
// StorageConfig
// =============================================================================

/// Validated, immutable settings for one storage engine.
///
/// Built through [`StorageConfig::builder`]; every interval, size and retry
/// count must be positive or construction fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    file_path: PathBuf,
    save_interval: Duration,
    batch_size: u64,
    max_retries: u32,
    retry_delay: Duration,
    temp_dir: Option<PathBuf>,
    save_retry_count: u32,
    save_retry_delay: Duration,
}

impl StorageConfig {
    /// Config with default tuning for the given file.
    #[must_use]
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            save_interval: Duration::from_secs(5),
            batch_size: 1000,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            temp_dir: None,
            save_retry_count: 3,
            save_retry_delay: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn builder(file_path: impl Into<PathBuf>) -> StorageConfigBuilder {
        StorageConfigBuilder {
            config: Self::new(file_path),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    pub fn save_retry_count(&self) -> u32 {
        self.save_retry_count
    }

    pub fn save_retry_delay(&self) -> Duration {
        self.save_retry_delay
    }

    /// Directory that receives temp files: `temp_dir` if set, else the
    /// destination's own directory so the final rename stays on one filesystem.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        if let Some(dir) = &self.temp_dir {
            return dir.clone();
        }
        match self.file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Builder for [`StorageConfig`].
#[derive(Debug, Clone)]
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    #[must_use]
    pub fn save_interval(mut self, interval: Duration) -> Self {
        self.config.save_interval = interval;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.temp_dir = dir;
        self
    }

    #[must_use]
    pub fn save_retry_count(mut self, count: u32) -> Self {
        self.config.save_retry_count = count;
        self
    }

    #[must_use]
    pub fn save_retry_delay(mut self, delay: Duration) -> Self {
        self.config.save_retry_delay = delay;
        self
    }

    pub fn build(self) -> std::result::Result<StorageConfig, ValidationError> {
        let c = self.config;
        if c.file_path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyField { field: "file_path" });
        }
        positive_duration("save_interval", c.save_interval)?;
        positive("batch_size", c.batch_size)?;
        positive("max_retries", u64::from(c.max_retries))?;
        positive_duration("retry_delay", c.retry_delay)?;
        positive("save_retry_count", u64::from(c.save_retry_count))?;
        positive_duration("save_retry_delay", c.save_retry_delay)?;
        Ok(c)
    }
}

fn positive(field: &'static str, value: u64) -> std::result::Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::NonPositive {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn positive_duration(
    field: &'static str,
    value: Duration,
) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::NonPositive {
            field,
            value: format!("{value:?}"),
        });
    }
    Ok(())
}

// =============================================================================
// lpfeed.toml
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub dedup: DedupSettings,
}

/// `[storage]` section, shared by every store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding one `<store>.msgpack` file per store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Staging directory for temp files; must share a filesystem with `data_dir`
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    #[serde(default = "default_retries")]
    pub save_retry_count: u32,

    #[serde(default = "default_save_retry_delay_ms")]
    pub save_retry_delay_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            save_interval_ms: default_save_interval_ms(),
            batch_size: default_batch_size(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            temp_dir: None,
            save_retry_count: default_retries(),
            save_retry_delay_ms: default_save_retry_delay_ms(),
        }
    }
}

impl StorageSettings {
    /// Build the engine config for the store named `name`.
    pub fn for_store(&self, name: &str) -> Result<StorageConfig> {
        let config = StorageConfig::builder(self.data_dir.join(format!("{name}.msgpack")))
            .save_interval(Duration::from_millis(self.save_interval_ms))
            .batch_size(self.batch_size)
            .max_retries(self.max_retries)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .temp_dir(self.temp_dir.clone())
            .save_retry_count(self.save_retry_count)
            .save_retry_delay(Duration::from_millis(self.save_retry_delay_ms))
            .build()?;
        Ok(config)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_save_interval_ms() -> u64 {
    5_000
}

fn default_batch_size() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_save_retry_delay_ms() -> u64 {
    500
}

/// `[pipeline]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    #[serde(default = "default_failure_log_capacity")]
    pub failure_log_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            intake_capacity: default_intake_capacity(),
            workers: default_workers(),
            submit_timeout_ms: default_submit_timeout_ms(),
            failure_log_capacity: default_failure_log_capacity(),
        }
    }
}

fn default_intake_capacity() -> usize {
    10_000
}

fn default_workers() -> usize {
    5
}

fn default_submit_timeout_ms() -> u64 {
    1_000
}

fn default_failure_log_capacity() -> usize {
    100
}

/// `[dedup]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_dedup_ttl_secs() -> u64 {
    3_600
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 5] = [
            ("pipeline.intake_capacity", self.pipeline.intake_capacity as u64),
            ("pipeline.workers", self.pipeline.workers as u64),
            ("pipeline.submit_timeout_ms", self.pipeline.submit_timeout_ms),
            (
                "pipeline.failure_log_capacity",
                self.pipeline.failure_log_capacity as u64,
            ),
            ("dedup.capacity", self.dedup.capacity as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be positive")).into());
            }
        }
        if self.dedup.ttl_secs == 0 {
            return Err(ConfigError::ValidationError("dedup.ttl_secs must be positive".into()).into());
        }
        // storage ranges are checked by building a throwaway store config
        self.storage
            .for_store("validate")
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }

    /// Pipeline tuning derived from the `[pipeline]` and `[dedup]` sections.
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            intake_capacity: self.pipeline.intake_capacity,
            workers: self.pipeline.workers,
            submit_timeout: Duration::from_millis(self.pipeline.submit_timeout_ms),
            failure_log_capacity: self.pipeline.failure_log_capacity,
            dedup_capacity: self.dedup.capacity,
            dedup_ttl: Duration::from_secs(self.dedup.ttl_secs),
        }
    }
}
