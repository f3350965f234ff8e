//! Host settings with persistence
//!
//! Settings are saved to `~/.config/atom/settings.toml`

use std::fs;
use std::path::PathBuf;

use atom_core::ClockConfig;
use atom_ecs::WorldConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// All host settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AtomSettings {
    pub world: WorldConfig,
    pub clock: ClockConfig,
    pub demo: DemoSettings,
}

impl AtomSettings {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("atom"))
    }

    fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.toml"))
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            warn!("Could not determine config directory");
            return Self::default();
        };

        if !path.exists() {
            info!("No settings file found, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(settings) => {
                    info!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    warn!("Failed to parse settings: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read settings file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.clock.validate()?;
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(dir) = Self::config_dir() else {
            anyhow::bail!("Could not determine config directory");
        };

        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let path = dir.join("settings.toml");
        fs::write(&path, toml::to_string_pretty(self)?)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// Parameters of the headless demo run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    /// Number of moving bodies spawned at start
    pub bodies: usize,
    /// Frames to simulate before exiting
    pub frames: u32,
    /// Run systems of a level in parallel
    pub parallel: bool,
    /// Default log filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            bodies: 64,
            frames: 120,
            parallel: true,
            log_filter: "info".to_string(),
        }
    }
}
