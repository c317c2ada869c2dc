//! Error types for archive operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while persisting or reading archive state
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid setting key: {0}")]
    InvalidSettingKey(String),
}

impl ArchiveError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that can occur while capturing media attachments
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media from chat {0} is not supported")]
    Unsupported(String),
    #[error("Message {0} carries no downloadable media")]
    NoMedia(String),
    #[error("Download failed after {attempts} attempt(s): {last_error}")]
    Fetch { attempts: u32, last_error: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
