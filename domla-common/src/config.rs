//! Configuration management for the Domla archive

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Marker for a single, ephemeral in-memory archive
pub const IN_MEMORY: &str = ":memory:";

fn default_backends() -> usize {
    1
}

fn default_optimize_hours() -> u64 {
    3
}

/// Main configuration for the archive storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding the shard databases, or `":memory:"` for a
    /// single ephemeral shard
    pub data_location: String,

    /// Number of shard databases, 1..=256
    #[serde(default = "default_backends")]
    pub backends: usize,

    /// Location of the external full-text index; derived from
    /// `data_location` when not set
    #[serde(default)]
    pub fulltext_location: Option<PathBuf>,

    /// Period of the background `PRAGMA optimize` pass, in hours
    #[serde(default = "default_optimize_hours")]
    pub optimize_hours: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_location: "./data".to_string(),
            backends: default_backends(),
            fulltext_location: None,
            optimize_hours: default_optimize_hours(),
        }
    }
}

impl ArchiveConfig {
    /// Configuration for a single ephemeral in-memory shard
    pub fn in_memory() -> Self {
        Self {
            data_location: IN_MEMORY.to_string(),
            backends: 1,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;

        let config: ArchiveConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.data_location.is_empty() {
            return Err(Error::Config("data_location must not be empty".into()));
        }
        if self.backends < 1 || self.backends > 256 {
            return Err(Error::Config(format!(
                "backends must be in 1..=256, got {}",
                self.backends
            )));
        }
        Ok(())
    }

    /// True when the archive lives in memory only
    pub fn is_in_memory(&self) -> bool {
        self.data_location == IN_MEMORY
    }

    /// Resolved location of the full-text index
    pub fn fulltext_path(&self) -> PathBuf {
        self.fulltext_location
            .clone()
            .unwrap_or_else(|| Path::new(&self.data_location).join("fulltext"))
    }
}
