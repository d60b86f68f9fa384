//! Configuration file loading
//!
//! Every section is optional; a missing file yields the defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blobs_core::StoreConfig;
use blobs_wants::WantConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub wants: WantConfig,
    pub log: LogConfig,
}

/// `[log]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// `<config_dir>/blobs/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("blobs").join("config.toml"))
}

/// Load the config at `path`, or at the default location when `None`
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_path() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[store]\npath = \"/srv/blobs\"\n\n[wants]\nrelay_hops = 2\n",
        )
        .unwrap();

        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.store.path, PathBuf::from("/srv/blobs"));
        assert_eq!(cfg.wants.relay_hops, 2);
        assert_eq!(cfg.wants.max_fetch_size, WantConfig::default().max_fetch_size);
        assert_eq!(cfg.log, LogConfig::default());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[store\n").unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }
}
