//! Persistent CLI configuration.
//!
//! A single JSON file under the platform config directory holds the sync
//! settings. Environment variables override individual fields so CI and
//! scripts can run without touching the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tally_core::SyncSettings;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CliConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub sync: Option<SyncSettings>,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join("tally").join(CONFIG_FILE_NAME))
        .ok_or_else(|| "failed to resolve the platform config directory".to_string())
}

pub fn default_data_dir() -> Result<PathBuf, String> {
    dirs::data_dir()
        .map(|dir| dir.join("tally"))
        .ok_or_else(|| "failed to resolve the platform data directory".to_string())
}

impl CliConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self {
                version: default_config_version(),
                sync: None,
            });
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("failed to read config at {}: {error}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|error| format!("failed to parse config at {}: {error}", path.display()))
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path()?;
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "failed to create config directory {}: {error}",
                    parent.display()
                )
            })?;
        }

        let serialized = serde_json::to_string_pretty(self)
            .map_err(|error| format!("failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("failed to write config at {}: {error}", path.display()))
    }
}

/// Settings from the config file with environment overrides applied;
/// `None` when no usable remote is configured
pub fn resolve_settings(config: &CliConfig) -> Option<SyncSettings> {
    let mut settings = config
        .sync
        .clone()
        .unwrap_or_else(|| SyncSettings::new("", ""));
    apply_env_overrides(&mut settings);

    if settings.server_url.trim().is_empty() || settings.database.trim().is_empty() {
        None
    } else {
        Some(settings)
    }
}

pub fn apply_env_overrides(settings: &mut SyncSettings) {
    if let Some(value) = env_non_empty("TALLY_SERVER_URL") {
        settings.server_url = value;
    }
    if let Some(value) = env_non_empty("TALLY_DATABASE") {
        settings.database = value;
    }
    if let Some(value) = env_non_empty("TALLY_USERNAME") {
        settings.username = Some(value);
    }
    if let Some(value) = env_non_empty("TALLY_PASSWORD") {
        settings.password = Some(value);
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
