//! Engine configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `MCA_DAQ_`, nested keys separated by `__`
//!    (e.g. `MCA_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! ```no_run
//! use mca_daq::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("config/default.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), mca_daq::error::DaqError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MCA_DAQ_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Acquisition timing
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Device definitions, in boot order
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "mca-daq".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Acquisition timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Upper bound on how long the MCA worker sleeps before re-checking cancellation
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Timeout of a single queue wait in the MCA worker
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            worker_timeout_ms: default_worker_timeout(),
        }
    }
}

impl AcquisitionConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker timeout as a duration.
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name; also the id of its settings subtree
    pub id: String,
    /// Registry type (e.g. "mock", "simulator")
    pub r#type: String,
    /// Whether this device is created at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Device-specific configuration (dynamic)
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_worker_timeout() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl EngineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path; environment variables override file values.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if !LOG_FORMATS.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        if self.acquisition.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.acquisition.worker_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "worker_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(DaqError::Configuration("Device with empty id".to_string()));
            }
            if !ids.insert(&device.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
        }

        Ok(())
    }

    /// Devices with `enabled = true`, in file order.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|device| device.enabled)
    }
}
