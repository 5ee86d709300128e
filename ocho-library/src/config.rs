//! User preference persistence for OCHO
//!
//! Stored as JSON under the platform config directory. Engine state is never
//! persisted, only the choices a dancer makes once and keeps.

use ocho_analysis::VoiceFilterMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub filter_mode: VoiceFilterMode,
    pub master_volume: f32,
    pub voice_volume: f32,
    /// Preferred voice language, a sub-directory of the voice pack
    pub voice_language: Option<String>,
    pub voices_dir: Option<PathBuf>,
    /// Play stems instead of the mixed file when available
    pub prefer_stems: bool,
    /// Scheduler tick period in milliseconds
    pub tick_ms: u64,
    /// Voice scheduling horizon in seconds
    pub look_ahead_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filter_mode: VoiceFilterMode::Full,
            master_volume: 1.0,
            voice_volume: 1.0,
            voice_language: None,
            voices_dir: None,
            prefer_stems: false,
            tick_ms: 20,
            look_ahead_secs: 1.5,
        }
    }
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if the file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => {
                debug!(path = %path.display(), "config loaded");
                config
            }
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                Self::default()
            }
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ocho")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testutil::scratch_dir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"filter_mode": "on1and5"}"#).unwrap();
        assert_eq!(config.filter_mode, VoiceFilterMode::On1And5);
        assert_eq!(config.tick_ms, 20);
        assert_eq!(config.look_ahead_secs, 1.5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = scratch_dir("config");
        let path = dir.join("nested").join("config.json");

        let config = Config {
            filter_mode: VoiceFilterMode::On1Times3,
            voice_volume: 0.6,
            voice_language: Some("es".into()),
            voices_dir: Some(PathBuf::from("/voices")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_file() {
        let dir = scratch_dir("config-bad");
        let path = dir.join("config.json");
        fs::write(&path, "filter_mode=full").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("ocho/config.json"));
    }
}
