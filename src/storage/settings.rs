//! Settings storage
//!
//! Persists the engine configuration as pretty-printed JSON.

use crate::inference::context::DEFAULT_CONTEXT_CAPACITY;
use crate::inference::sampler::SamplingConfig;
use crate::storage::{default_models_dir, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Applied to every new session
    pub sampling: SamplingConfig,
    /// Context window size in tokens
    pub context_capacity: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            context_capacity: DEFAULT_CONTEXT_CAPACITY,
            gpu_layers: 0,
            models_directory: default_models_dir().unwrap_or_else(|_| PathBuf::from("./models")),
        }
    }
}

impl EngineSettings {
    /// Brings hand-edited values back into range
    pub fn validate(&mut self) {
        self.sampling.validate();

        if self.context_capacity == 0 {
            self.context_capacity = DEFAULT_CONTEXT_CAPACITY;
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Same as [`load_settings`] for an explicit file
pub fn load_settings_from(path: &Path) -> EngineSettings {
    match read_settings(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

fn read_settings(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
