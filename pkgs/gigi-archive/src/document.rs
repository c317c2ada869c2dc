//! Whole-file JSON documents backing each persisted table
//!
//! Every save serializes the complete value to a sibling temp file, syncs it
//! and renames it over the document, so a crash leaves either the old or the
//! new contents on disk. Unparsable documents are moved aside on load and
//! replaced by an empty value.

use crate::error::{ArchiveError, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Handle to one JSON document on disk
#[derive(Debug)]
pub struct JsonDocument<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. Missing, empty, unreadable and corrupt documents
    /// all yield `None`; corrupt ones are quarantined first.
    pub fn load(&self) -> Option<T> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                error!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Document {} is corrupt: {}", self.path.display(), e);
                match quarantine(&self.path) {
                    Ok(target) => warn!("Moved corrupt document to {}", target.display()),
                    Err(e) => error!("Failed to quarantine {}: {}", self.path.display(), e),
                }
                None
            }
        }
    }

    /// Atomically replace the document with `value`
    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }

        let bytes = serde_json::to_vec(value)?;
        let tmp = temp_path(&self.path);
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()
        };
        write().map_err(|e| ArchiveError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(ArchiveError::io(&self.path, e));
        }

        debug!("Saved {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }

    /// Save, retrying once on failure
    pub fn save_with_retry(&self, value: &T) -> Result<()> {
        match self.save(value) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Retrying save of {}: {}", self.path.display(), e);
                self.save(value)
            }
        }
    }
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Load the document or start from an empty value
    pub fn load_or_default(&self) -> T {
        self.load().unwrap_or_default()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Rename a corrupt file to `<name>.corrupt-<UTC timestamp>`
pub(crate) fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", stamp));
    let target = path.with_file_name(name);
    fs::rename(path, &target)?;
    Ok(target)
}
