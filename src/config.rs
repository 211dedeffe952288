//! Configuration for geobatch runs.

use crate::io::ReaderOptions;
use crate::pipeline::{default_workers, ErrorPolicy, PoolOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable enabling debug mode.
pub const DEBUG_ENV: &str = "GEOBATCH_DEBUG";

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Engine sizing
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Chunked reading
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Pool helper used for independent tasks
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub debug: DebugConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of worker threads (default: available cores minus `reserve_cores`)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Cores left for the reader, the controller and the OS
    #[serde(default = "default_reserve_cores")]
    pub reserve_cores: usize,

    /// Capacity of the input and output queues (default: number of workers)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after a run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            reserve_cores: default_reserve_cores(),
            queue_capacity: None,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| default_workers(self.reserve_cores))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Records per batch
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Leading batches to discard
    #[serde(default)]
    pub skip: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            skip: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_threads")]
    pub threads: usize,

    /// Log failed tasks and carry on instead of stopping
    #[serde(default)]
    pub ignore_errors: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: default_pool_threads(),
            ignore_errors: false,
        }
    }
}

/// Debug mode keeps the reader going after failures, relaxes the pool's
/// stop policy and writes verbose logs to a scratch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_debug_log_path")]
    pub log_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: default_debug_log_path(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Enable debug mode when `GEOBATCH_DEBUG` is `1` or `true`.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(DEBUG_ENV) {
            self.apply_debug_flag(&value);
        }
    }

    fn apply_debug_flag(&mut self, value: &str) {
        if matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true") {
            self.debug.enabled = true;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reader.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.pipeline.workers == Some(0) {
            anyhow::bail!("Workers must be > 0");
        }
        if self.pipeline.queue_capacity == Some(0) {
            anyhow::bail!("Queue capacity must be > 0");
        }
        if self.pool.threads == 0 {
            anyhow::bail!("Pool threads must be > 0");
        }
        Ok(())
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions::default()
            .with_chunk_size(self.reader.chunk_size)
            .with_skip(self.reader.skip)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            threads: self.pool.threads,
            errors: if self.pool.ignore_errors {
                ErrorPolicy::Ignore
            } else {
                ErrorPolicy::Stop
            },
            debug: self.debug.enabled,
        }
    }
}

fn default_reserve_cores() -> usize { 2 }
fn default_metrics_interval() -> u64 { 10 }
fn default_chunk_size() -> usize { crate::io::DEFAULT_CHUNK_SIZE }
fn default_pool_threads() -> usize { 10 }
fn default_debug_log_path() -> PathBuf { std::env::temp_dir().join("geobatch-debug.log") }
