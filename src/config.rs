//! Configuration for applications embedding the history engine.
//!
//! Stored as JSON in `config.json` under a caller-supplied directory.
//! Missing files and missing fields fall back to defaults, so older config
//! files keep loading after upgrades.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HistoryResult;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the engine's data; `None` leaves the choice to the
    /// embedding application
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Separator between category hierarchy levels
    #[serde(default = "default_category_separator")]
    pub category_separator: String,
}

fn default_category_separator() -> String {
    "/".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            category_separator: default_category_separator(),
        }
    }
}

impl Config {
    /// Load the configuration from `<dir>/config.json`; a missing file
    /// yields the defaults.
    pub fn load(dir: &Path) -> HistoryResult<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Save the configuration to `<dir>/config.json`, creating the
    /// directory as needed.
    pub fn save(&self, dir: &Path) -> HistoryResult<()> {
        fs::create_dir_all(dir)?;
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(dir.join("config.json"), contents)?;
        Ok(())
    }
}
