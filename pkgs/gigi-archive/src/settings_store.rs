//! Setting store - key/value settings, one JSON document per key

use crate::document::JsonDocument;
use crate::error::{ArchiveError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Key for storing the runtime retention policy
pub const RETENTION_POLICY_KEY: &str = "retention_policy";

const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingEntry {
    key: String,
    value: String,
    updated_at: i64,
}

/// Keys double as file names, so only `[A-Za-z0-9_.-]` is accepted and the
/// first character must be alphanumeric.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.starts_with(|c: char| c.is_ascii_alphanumeric())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArchiveError::InvalidSettingKey(key.to_string()))
    }
}

/// Setting store for persisted bot settings
pub struct SettingStore {
    dir: PathBuf,
    entries: Mutex<BTreeMap<String, SettingEntry>>,
}

impl SettingStore {
    /// Open the store, loading every setting found in `dir`
    pub fn open(dir: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("Failed to create settings directory {}: {}", dir.display(), e);
        }

        let mut entries = BTreeMap::new();
        match fs::read_dir(dir) {
            Ok(listing) => {
                for entry in listing.filter_map(|entry| entry.ok()) {
                    let path = entry.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(setting) = JsonDocument::<SettingEntry>::new(&path).load() else {
                        continue;
                    };
                    let expected = format!("{}.json", setting.key);
                    if path.file_name().and_then(|name| name.to_str()) != Some(expected.as_str())
                    {
                        warn!("Ignoring setting file {} with key {}", path.display(), setting.key);
                        continue;
                    }
                    entries.insert(setting.key.clone(), setting);
                }
            }
            Err(e) => error!("Failed to read settings directory {}: {}", dir.display(), e),
        }

        debug!("Loaded {} settings from {}", entries.len(), dir.display());
        Self {
            dir: dir.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    fn document(&self, key: &str) -> JsonDocument<SettingEntry> {
        JsonDocument::new(self.dir.join(format!("{}.json", key)))
    }

    /// Get a setting value by key
    pub fn get(&self, key: &str) -> Option<String> {
        debug!("Getting setting: {}", key);
        self.entries.lock().get(key).map(|entry| entry.value.clone())
    }

    /// Set a setting value
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        debug!("Setting key: {}", key);

        let entry = SettingEntry {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let mut entries = self.entries.lock();
        self.document(key).save_with_retry(&entry)?;
        entries.insert(key.to_string(), entry);

        info!("Setting '{}' updated successfully", key);
        Ok(())
    }

    /// Delete a setting by key
    pub fn delete(&self, key: &str) -> Result<bool> {
        debug!("Deleting setting: {}", key);

        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(false);
        }
        let path = self.document(key).path().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ArchiveError::io(path, e)),
        }
        entries.remove(key);
        Ok(true)
    }

    /// Get all settings
    pub fn get_all(&self) -> Vec<(String, String)> {
        self.entries
            .lock()
            .values()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    }

    /// Clear all settings
    pub fn clear_all(&self) -> Result<u64> {
        info!("Clearing all settings");

        let keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        let mut removed = 0;
        for key in keys {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Check if a setting exists
    pub fn exists(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Set multiple settings. Keys are validated up front; a write failure
    /// part way leaves earlier keys written.
    pub fn set_many(&self, items: &[(String, String)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        for (key, _) in items {
            validate_key(key)?;
        }
        for (key, value) in items {
            self.set(key, value)?;
        }

        info!("Set {} settings successfully", items.len());
        Ok(())
    }

    /// Decode a JSON-encoded setting; undecodable values read as absent
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Setting '{}' is not valid JSON: {}", key, e);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}
