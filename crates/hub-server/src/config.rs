//! Hub configuration file
//!
//! Every section is optional. A missing file yields the defaults.

use hub_automation::AutomationConfig;
use hub_device_tracker::DeviceTrackerConfig;
use hub_scheduler::{ScheduleError, SchedulerConfig};
use hub_worker_pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid scheduler settings in {path}: {source}")]
    Scheduler {
        path: PathBuf,
        #[source]
        source: ScheduleError,
    },
}

impl From<ConfigError> for hub_core::HubError {
    fn from(err: ConfigError) -> Self {
        hub_core::HubError::Configuration(err.to_string())
    }
}

/// Top-level hub settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub worker_pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub device_tracker: DeviceTrackerConfig,
    pub automations: Vec<AutomationConfig>,
}

impl HubConfig {
    /// Load from a YAML file; a file that does not exist gives the defaults
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::ReadFile {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        debug!(path = %path.display(), "Loading configuration");
        Self::from_yaml(&content, path)
    }

    /// Parse YAML text; `source` only labels errors
    pub fn from_yaml(content: &str, source: &Path) -> ConfigResult<Self> {
        // An empty document is a null, which means "all defaults"
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source.to_path_buf(),
            source: e,
        })?;
        config
            .scheduler
            .validate()
            .map_err(|e| ConfigError::Scheduler {
                path: source.to_path_buf(),
                source: e,
            })?;
        Ok(config)
    }
}
