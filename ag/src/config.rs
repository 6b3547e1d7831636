//! Configuration for admitgate

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scheduler::SchedulerConfig;

/// Top-level configuration file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Where cross-context entries are kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store directory; defaults to the one the `ss` tool uses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(sharedstore::config::default_store_path)
    }
}

impl Config {
    /// Config file candidates, in priority order
    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".admitgate.yml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("admitgate").join("admitgate.yml"));
        }
        paths
    }

    fn find(path: Option<&PathBuf>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(path.clone());
        }
        Self::default_paths().into_iter().find(|p| p.exists())
    }

    /// Load config from the explicit path, else the first default location
    /// that exists, else defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        match Self::find(path) {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("Config::load: no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a config file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load_from_file: called");
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).context(format!("Failed to parse config file {}", path.display()))?;
        config
            .scheduler
            .validate()
            .context(format!("Invalid scheduler section in {}", path.display()))?;
        Ok(config)
    }

    /// Read only the log level, ignoring any error
    ///
    /// Used before logging is set up, so failures here stay silent and are
    /// reported by the full load afterwards.
    pub fn load_log_level(path: Option<&PathBuf>) -> Option<String> {
        let path = Self::find(path)?;
        let content = std::fs::read_to_string(path).ok()?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
        value.get("log_level")?.as_str().map(str::to_string)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).context(format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}
