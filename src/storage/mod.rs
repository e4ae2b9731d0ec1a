//! Persistent storage
//!
//! Engine settings and the local model store.

use std::path::PathBuf;
use thiserror::Error;

pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("No model available: {0}")]
    ModelNotFound(String),
    #[error("Model download failed: {0}")]
    Download(String),
    #[error("SHA-256 mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Download(e.to_string())
    }
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\PocketLLM\PocketLLM\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.PocketLLM.PocketLLM`
/// - Linux: `/home/{user}/.local/share/pocketllm`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "PocketLLM", "PocketLLM")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Default location of downloaded and bundled models
pub fn default_models_dir() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("models"))
}

/// Creates the data directory and its `models/` subdirectory
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(data_dir.join("models"))?;

    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(data_dir)
}
