//! Store configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::BlobStore;

/// `[store]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base directory holding `sha256/` and `tmp/`
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("blobs"),
        }
    }
}

impl StoreConfig {
    /// Open the store this section points at
    pub fn open(&self) -> Result<BlobStore> {
        BlobStore::open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_section_empty() {
        let cfg: StoreConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, StoreConfig::default());
    }

    #[test]
    fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b").display().to_string();
        let cfg: StoreConfig = toml::from_str(&format!("path = {path:?}")).unwrap();
        let store = cfg.open().unwrap();
        assert!(store.path().join("sha256").is_dir());
    }
}
