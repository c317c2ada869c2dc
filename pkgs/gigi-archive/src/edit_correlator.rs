//! Edit correlator - links edited messages back to the message they replace
//!
//! Matching is a heuristic: the first recent unedited message in the same
//! chat whose leading word equals the edited text's leading word wins. False
//! positives and misses are accepted.

use crate::content;
use crate::document::JsonDocument;
use crate::events::RawMessage;
use crate::message_store::MessageStore;
use crate::records::{ContextBackup, EditMapping};
use crate::retention::PolicyHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const EDITS_FILE: &str = "edits.json";
pub const CONTEXT_BACKUPS_FILE: &str = "context_backups.json";

/// Default number of recent messages inspected per edit
pub const DEFAULT_SCAN_WINDOW: usize = 10;

#[derive(Debug, Default)]
struct EditState {
    mappings: HashMap<String, EditMapping>,
    backups: HashMap<String, ContextBackup>,
}

pub struct EditCorrelator {
    store: Arc<MessageStore>,
    policy: PolicyHandle,
    scan_window: usize,
    state: Mutex<EditState>,
    edits_doc: JsonDocument<HashMap<String, EditMapping>>,
    backups_doc: JsonDocument<HashMap<String, ContextBackup>>,
}

fn leading_token(text: &str) -> Option<&str> {
    text.split_whitespace().next()
}

impl EditCorrelator {
    pub fn open(
        data_dir: &Path,
        store: Arc<MessageStore>,
        policy: PolicyHandle,
        scan_window: usize,
    ) -> Self {
        let edits_doc = JsonDocument::new(data_dir.join(EDITS_FILE));
        let backups_doc = JsonDocument::new(data_dir.join(CONTEXT_BACKUPS_FILE));
        let state = EditState {
            mappings: edits_doc.load_or_default(),
            backups: backups_doc.load_or_default(),
        };
        debug!(
            "Loaded {} edit mappings and {} context backups",
            state.mappings.len(),
            state.backups.len()
        );

        Self {
            store,
            policy,
            scan_window,
            state: Mutex::new(state),
            edits_doc,
            backups_doc,
        }
    }

    /// Correlate an edited message with the message it replaces.
    ///
    /// Returns the stored mapping, or `None` when `raw` is not an edit or no
    /// candidate matched.
    pub fn correlate(&self, raw: &RawMessage) -> Option<EditMapping> {
        let edited = raw.edited_content()?;
        if let Some(existing) = self.mapping(&raw.id) {
            return Some(existing);
        }

        let text = content::extract_text(&raw.content)?;
        let token = leading_token(&text)?;

        let original = self
            .store
            .recent_by_chat(&raw.chat_id, usize::MAX)
            .filter(|record| !record.is_edited && record.id != raw.id)
            .take(self.scan_window)
            .find(|record| {
                record
                    .text_content
                    .as_deref()
                    .and_then(leading_token)
                    .is_some_and(|candidate| candidate == token)
            });
        let Some(original) = original else {
            debug!("No original found for edited message {}", raw.id);
            return None;
        };

        let now = Utc::now();
        let mapping = EditMapping {
            edited_id: raw.id.clone(),
            original_id: original.id.clone(),
            chat_id: raw.chat_id.clone(),
            created_at: now,
        };
        let backup = content::reply_context(edited)
            .or_else(|| content::reply_context(&raw.content))
            .and_then(|context| serde_json::to_value(context).ok())
            .map(|context| ContextBackup {
                message_id: raw.id.clone(),
                context,
                stored_at: now,
                expires_at: now + self.policy.current().context_backup_ttl(),
            });

        let mut state = self.state.lock();
        state.mappings.insert(raw.id.clone(), mapping.clone());
        if let Err(e) = self.edits_doc.save_with_retry(&state.mappings) {
            error!("Failed to persist edit mapping for {}: {}", raw.id, e);
            state.mappings.remove(&raw.id);
            return None;
        }

        if let Some(backup) = backup {
            state.backups.insert(raw.id.clone(), backup);
            if let Err(e) = self.backups_doc.save_with_retry(&state.backups) {
                error!("Failed to persist reply context for {}: {}", raw.id, e);
                state.backups.remove(&raw.id);
            }
        }

        info!(
            "Edited message {} correlated to {} in {}",
            mapping.edited_id, mapping.original_id, mapping.chat_id
        );
        Some(mapping)
    }

    pub fn mapping(&self, edited_id: &str) -> Option<EditMapping> {
        self.state.lock().mappings.get(edited_id).cloned()
    }

    pub fn original_of(&self, edited_id: &str) -> Option<String> {
        self.state
            .lock()
            .mappings
            .get(edited_id)
            .map(|mapping| mapping.original_id.clone())
    }

    pub fn context_backup(&self, message_id: &str) -> Option<ContextBackup> {
        self.state.lock().backups.get(message_id).cloned()
    }

    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Drop mappings and backups that mention evicted messages
    pub fn prune_messages(&self, evicted: &HashSet<String>) -> usize {
        if evicted.is_empty() {
            return 0;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let before = state.mappings.len();
        state.mappings.retain(|edited_id, mapping| {
            !evicted.contains(edited_id) && !evicted.contains(&mapping.original_id)
        });
        let pruned = before - state.mappings.len();

        let backups_before = state.backups.len();
        state.backups.retain(|id, _| !evicted.contains(id));
        let backups_pruned = backups_before - state.backups.len();

        if pruned > 0 {
            if let Err(e) = self.edits_doc.save_with_retry(&state.mappings) {
                error!("Failed to persist pruned edit mappings: {}", e);
            }
        }
        if backups_pruned > 0 {
            if let Err(e) = self.backups_doc.save_with_retry(&state.backups) {
                error!("Failed to persist pruned context backups: {}", e);
            }
        }
        pruned
    }

    /// Remove context backups whose own TTL has passed
    pub fn expire_context_backups(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let before = state.backups.len();
        state.backups.retain(|_, backup| !backup.is_expired(now));
        let expired = before - state.backups.len();

        if expired > 0 {
            if let Err(e) = self.backups_doc.save_with_retry(&state.backups) {
                error!("Failed to persist expired context backups: {}", e);
            }
            debug!("Expired {} context backups", expired);
        }
        expired
    }
}
