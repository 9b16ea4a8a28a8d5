use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directories indexed when the content cache is first built
    pub content_directories: Vec<PathBuf>,
    /// Cache snapshot location; `None` keeps the cache in memory
    pub cache_path: Option<PathBuf>,
    /// Skip hashing pieces whose files are all matched already
    pub fast_verification: bool,
    /// Refuse to run when a piece has more combinations than this
    pub max_combinations: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            content_directories: Vec::new(),
            cache_path: dirs::cache_dir().map(|d| d.join("refind").join("content-cache.json")),
            fast_verification: false,
            max_combinations: None, // unlimited
        }
    }
}

impl Config {
    /// `<config dir>/refind/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("refind").join("config.json"))
    }

    /// Read a config file, or the defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
