//! Application settings
//!
//! Stored as TOML at `<config dir>/tapendos/settings.toml`. Every section has
//! defaults, so a partial file is fine and a missing file means "all defaults".

use crate::control::ControllerSettings;
use crate::stimulation::StimulationRequest;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory name below the platform config directory
pub const APP_DIR: &str = "tapendos";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stimulation parameters used when the command line sets none
    pub stimulation: StimulationRequest,

    pub controller: ControllerSettings,

    /// Presence polling period of the hardware backend
    pub presence_poll_ms: u64,

    /// Overrides the location of the key/value store
    pub store_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stimulation: StimulationRequest::app_defaults(),
            controller: ControllerSettings::default(),
            presence_poll_ms: 1000,
            store_path: None,
        }
    }
}

/// Platform config directory for this application
pub fn config_dir() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    dir.push(APP_DIR);
    dir
}

impl Settings {
    pub fn default_path() -> PathBuf {
        config_dir().join(SETTINGS_FILE)
    }

    /// Loads settings; a missing file yields defaults, a malformed one an error
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check settings file {}: {}", path.display(), e))?
        {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;
        let settings = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Like [`Settings::load`], but falls back to defaults on any error
    pub async fn load_or_default(path: &Path) -> Self {
        Self::load(path).await.unwrap_or_else(|e| {
            warn!("Using default settings: {}", e);
            Self::default()
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        info!("Settings saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulation::{RepeatMode, StimulationConfig};

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.toml"))
            .await
            .unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.controller.error_display_ms, 2000);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        tokio::fs::write(
            &path,
            "presence_poll_ms = 250\n\n[stimulation]\namplitude = 0.8\nrepeat_mode = \"count\"\nrepeat_count = 5\n",
        )
        .await
        .unwrap();

        let settings = Settings::load(&path).await.unwrap();
        assert_eq!(settings.presence_poll_ms, 250);
        assert_eq!(settings.controller, ControllerSettings::default());

        let config = StimulationConfig::from(&settings.stimulation);
        assert_eq!(config.amplitude(), 0.8);
        assert_eq!(config.repeat_mode(), RepeatMode::Count);
        assert_eq!(config.repeat_count(), 5);
        // Sections given in the file replace the whole default section
        assert_eq!(config.pulse_duration_ms(), 300);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        tokio::fs::write(&path, "presence_poll_ms = \"often\"").await.unwrap();

        assert!(Settings::load(&path).await.is_err());
        assert_eq!(Settings::load_or_default(&path).await, Settings::default());
    }

    #[tokio::test]
    async fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("settings.toml");
        let mut settings = Settings::default();
        settings.controller.error_display_ms = 750;
        settings.store_path = Some(dir.path().join("store.toml"));

        settings.save(&path).await.unwrap();
        assert_eq!(Settings::load(&path).await.unwrap(), settings);
    }
}
