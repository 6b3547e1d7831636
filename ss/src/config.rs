//! Configuration for the `ss` tool

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one file per key
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// Default store directory, shared with the `ag` binary
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharedstore")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
        }
    }
}

impl Config {
    /// Explicit path, else `./.sharedstore.yml`, else
    /// `<config_dir>/sharedstore/sharedstore.yml`, else defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let mut candidates = vec![PathBuf::from(".sharedstore.yml")];
        candidates.extend(dirs::config_dir().map(|dir| dir.join("sharedstore").join("sharedstore.yml")));

        match candidates.into_iter().find(|p| p.exists()) {
            Some(found) => Self::load_from_file(&found),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content).context(format!("Failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sharedstore.yml");
        std::fs::write(&path, "store_path: /tmp/shared\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/shared"));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let err = Config::load(Some(&temp.path().join("missing.yml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_missing_field_uses_default() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }
}
