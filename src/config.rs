//! Configuration management for Keyrate.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables such as `KEYRATE_WORKER__TICK_INTERVAL_MS=250`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{KeyrateError, Result};

/// Main configuration for the Keyrate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrateConfig {
    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Period between refill passes in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Number of workers sharing one store
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            workers: default_workers(),
        }
    }
}

fn default_tick_interval() -> u64 {
    500
}

fn default_workers() -> usize {
    4
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl KeyrateConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let builder = builder.add_source(
            Environment::with_prefix("KEYRATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Self::build(builder)
    }

    /// Load configuration from a YAML string, ignoring the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: KeyrateConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| KeyrateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.tick_interval_ms == 0 {
            return Err(KeyrateError::Config("tick_interval_ms must be positive".into()));
        }
        if self.worker.workers == 0 {
            return Err(KeyrateError::Config("at least one worker is required".into()));
        }
        Ok(())
    }
}
