//! Persistent storage
//!
//! Configuration files, the local models directory and Hugging Face Hub downloads.

pub mod config_manager;
pub mod huggingface;
pub mod settings;

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

pub use config_manager::{ConfigError, ConfigManager, ConfigWatcher, ReloadOutcome};
pub use settings::Settings;

/// Errors raised while locating or touching on-disk state
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine a data directory for this platform")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-user data directory (`~/.local/share/localqa` on Linux)
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("", "", "localqa")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
