//! Configuration.
//!
//! Loaded from YAML files and `COHORTMQ__`-prefixed environment variables.

mod native;

pub use native::NativeConfig;

use serde::Deserialize;

use crate::bus::{BusError, ProviderOptions, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "cohortmq.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COHORTMQ_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COHORTMQ";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COHORTMQ_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which bus provider to create.
    pub provider: ProviderOptions,
    /// Native broker settings.
    pub native: NativeConfig,
    /// Settings for the demo binary.
    pub demo: DemoConfig,
}

/// Demo binary settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Worker processes to fork.
    pub workers: usize,
    /// Jobs to push through the work queue.
    pub jobs: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { workers: 2, jobs: 6 }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `cohortmq.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `COHORTMQ__NATIVE__MAX_FRAME_BYTES`
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| BusError::Config(e.to_string()))
    }
}
