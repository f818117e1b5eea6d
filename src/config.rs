//! Persistent settings.
//!
//! JSON under the platform config directory. Unreadable or missing files
//! fall back to defaults with a warning; saves go through a temp file
//! and rename so a crash never leaves a torn config.

use std::fs;
use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub relay_url: String,
    pub channel: String,
    pub nickname: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:5555".to_string(),
            channel: "#voice".to_string(),
            nickname: None,
            input_device: None,
            output_device: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::NoConfigDir => write!(f, "no config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn default_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(dir.join("relay-voice").join("settings.json"))
}

impl Settings {
    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        match default_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("invalid settings file {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("cannot read {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = default_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(ConfigError::Parse)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(ConfigError::Io)?;
        fs::rename(&tmp, path).map_err(ConfigError::Io)?;
        Ok(())
    }
}
