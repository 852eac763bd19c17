//! Engine configuration.
//!
//! Every section has a `Default` matching the values used in play; a JSON
//! file may override any subset of fields.

use crate::feedback::AutoTagConfig;
use crate::registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_GROUP: &str = "attackcycle";
pub const DEFAULT_CONFIG_KEY: &str = "db_v2";
pub const DEFAULT_BACKUP_FILE: &str = "attack-cycle-db-v2.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sightings are ignored entirely while off
    pub recording_enabled: bool,
    /// A countdown older than `stale_factor * interval` ticks reports unknown
    pub stale_factor: i64,
    /// Display `left - 1` (never below 1)
    pub countdown_minus_one: bool,
    pub auto_tag: AutoTagConfig,
    pub registry: RegistryConfig,
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recording_enabled: true,
            stale_factor: 2,
            countdown_minus_one: false,
            auto_tag: AutoTagConfig::default(),
            registry: RegistryConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub group: String,
    pub key: String,
    /// JSON file standing in for the key-value config store
    pub store_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    /// Coalescing window for dirty notifications
    pub debounce_ms: u64,
    pub channel_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_CONFIG_GROUP.to_string(),
            key: DEFAULT_CONFIG_KEY.to_string(),
            store_path: None,
            backup_path: None,
            debounce_ms: 500,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Failed to read config: {}", e),
            Self::Parse(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json_str(&text)
    }
}
