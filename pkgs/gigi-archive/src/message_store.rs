//! Message store - archive of every observed message, kept as whole-file JSON documents

use crate::content;
use crate::document::JsonDocument;
use crate::error::Result;
use crate::events::RawMessage;
use crate::media_store::{MediaPatch, MediaPool, MediaStore};
use crate::records::{DeletionRecord, MediaRecord, MessageKind, MessageRecord};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// File name of the messages table
pub const MESSAGES_FILE: &str = "messages.json";

/// File name of the deletion log
pub const DELETED_FILE: &str = "deleted.json";

#[derive(Debug, Default)]
struct Tables {
    messages: HashMap<String, MessageRecord>,
    deleted: Vec<DeletionRecord>,
}

/// Message store - the in-memory index is authoritative and every mutation
/// is written through to disk before it is reported as done
pub struct MessageStore {
    tables: Mutex<Tables>,
    messages_doc: JsonDocument<HashMap<String, MessageRecord>>,
    deleted_doc: JsonDocument<Vec<DeletionRecord>>,
    media_pool: Option<MediaPool>,
}

impl MessageStore {
    /// Open the store in `data_dir` without media capture
    pub fn open(data_dir: &Path) -> Self {
        Self::build(data_dir, None)
    }

    /// Open the store in `data_dir`, submitting media downloads to `pool`
    pub fn with_media_pool(data_dir: &Path, pool: MediaPool) -> Self {
        Self::build(data_dir, Some(pool))
    }

    fn build(data_dir: &Path, media_pool: Option<MediaPool>) -> Self {
        let messages_doc = JsonDocument::new(data_dir.join(MESSAGES_FILE));
        let deleted_doc = JsonDocument::new(data_dir.join(DELETED_FILE));
        let tables = Tables {
            messages: messages_doc.load_or_default(),
            deleted: deleted_doc.load_or_default(),
        };

        info!(
            "Message store initialized at {} ({} messages, {} deletions)",
            data_dir.display(),
            tables.messages.len(),
            tables.deleted.len()
        );

        Self {
            tables: Mutex::new(tables),
            messages_doc,
            deleted_doc,
            media_pool,
        }
    }

    /// Archive a raw message, ingested now
    pub fn archive(&self, raw: &RawMessage) -> bool {
        self.archive_at(raw, Utc::now())
    }

    /// Archive a raw message with an explicit ingest time.
    ///
    /// Returns true when the message is stored, already archived, or
    /// filtered as noise. Returns false only if persistence failed.
    pub fn archive_at(&self, raw: &RawMessage, ingested_at: DateTime<Utc>) -> bool {
        if content::is_noise(&raw.content) {
            debug!("Skipping message {} without archival value", raw.id);
            return true;
        }

        let record = build_record(raw, ingested_at);
        let kind = record.kind;
        {
            let mut tables = self.tables.lock();
            if tables.messages.contains_key(&raw.id) {
                debug!("Message {} already archived", raw.id);
                return true;
            }

            tables.messages.insert(raw.id.clone(), record);
            if let Err(e) = self.messages_doc.save_with_retry(&tables.messages) {
                error!("Failed to archive message {}: {}", raw.id, e);
                tables.messages.remove(&raw.id);
                return false;
            }
        }
        debug!("Archived message {} ({:?}) in {}", raw.id, kind, raw.chat_id);

        if kind.is_media() {
            if let Some(pool) = &self.media_pool {
                pool.submit(raw.clone(), kind);
            }
        }
        true
    }

    /// Attach downloaded media to a record. Only the first patch is applied.
    pub fn attach_media(&self, message_id: &str, media: MediaRecord) -> bool {
        let mut tables = self.tables.lock();
        let Some(record) = tables.messages.get_mut(message_id) else {
            debug!("Media arrived for unknown message {}", message_id);
            return false;
        };
        if record.media.is_some() {
            debug!("Message {} already has media", message_id);
            return false;
        }

        record.media = Some(media);
        if let Err(e) = self.messages_doc.save_with_retry(&tables.messages) {
            error!("Failed to attach media to {}: {}", message_id, e);
            if let Some(record) = tables.messages.get_mut(message_id) {
                record.media = None;
            }
            return false;
        }
        debug!("Attached media to message {}", message_id);
        true
    }

    /// Apply download completions until every pool handle is dropped.
    ///
    /// Files whose record disappeared before the patch landed are removed.
    pub async fn apply_media_patches(
        self: Arc<Self>,
        media: Arc<MediaStore>,
        mut patches: mpsc::UnboundedReceiver<MediaPatch>,
    ) {
        while let Some(patch) = patches.recv().await {
            let Ok(record) = patch.result else {
                continue;
            };
            let relative_path = record.relative_path.clone();
            let attached = self.attach_media(&patch.message_id, record);
            media.settle(&relative_path);
            if !attached {
                match media.remove(&relative_path) {
                    Ok(_) => debug!("Dropped unattached media {}", relative_path),
                    Err(e) => warn!("Failed to drop unattached media {}: {}", relative_path, e),
                }
            }
        }
        debug!("Media patch channel closed");
    }

    /// Get message by ID
    pub fn get(&self, message_id: &str) -> Option<MessageRecord> {
        self.tables.lock().messages.get(message_id).cloned()
    }

    pub fn get_media(&self, message_id: &str) -> Option<MediaRecord> {
        self.tables
            .lock()
            .messages
            .get(message_id)
            .and_then(|record| record.media.clone())
    }

    /// Mark a message deleted and append a deletion snapshot.
    ///
    /// Returns false for unknown ids. A record already marked deleted is
    /// left as is so each message has at most one deletion record.
    pub fn mark_deleted(&self, message_id: &str, chat_id: &str) -> bool {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let Some(record) = tables.messages.get_mut(message_id) else {
            debug!("Cannot mark unknown message {} deleted", message_id);
            return false;
        };
        if record.chat_id != chat_id {
            warn!(
                "Deletion of {} reported in {} but archived in {}",
                message_id, chat_id, record.chat_id
            );
        }
        if record.deleted {
            return true;
        }

        record.deleted = true;
        tables
            .deleted
            .push(DeletionRecord::snapshot(record, Utc::now()));

        if let Err(e) = self.messages_doc.save_with_retry(&tables.messages) {
            error!("Failed to mark message {} deleted: {}", message_id, e);
            Self::unmark_deleted(tables, message_id);
            return false;
        }
        if let Err(e) = self.deleted_doc.save_with_retry(&tables.deleted) {
            error!("Failed to record deletion of {}: {}", message_id, e);
            Self::unmark_deleted(tables, message_id);
            if let Err(e) = self.messages_doc.save_with_retry(&tables.messages) {
                error!(
                    "Failed to restore {} after aborted deletion: {}",
                    message_id, e
                );
            }
            return false;
        }

        info!("Marked message {} in {} as deleted", message_id, chat_id);
        true
    }

    fn unmark_deleted(tables: &mut Tables, message_id: &str) {
        tables.deleted.pop();
        if let Some(record) = tables.messages.get_mut(message_id) {
            record.deleted = false;
        }
    }

    /// Newest-first records of one chat, at most `limit` of them
    pub fn recent_by_chat(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> impl Iterator<Item = MessageRecord> {
        let mut records: Vec<MessageRecord> = self
            .tables
            .lock()
            .messages
            .values()
            .filter(|record| record.chat_id == chat_id)
            .cloned()
            .collect();
        sort_newest_first(&mut records);
        records.truncate(limit);
        records.into_iter()
    }

    /// Most recent deletion snapshots across all chats
    pub fn recent_deletions(&self, limit: usize) -> Vec<DeletionRecord> {
        let mut deletions = self.tables.lock().deleted.clone();
        deletions.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        deletions.truncate(limit);
        deletions
    }

    pub fn deletions_for_chat(&self, chat_id: &str, limit: usize) -> Vec<DeletionRecord> {
        let mut deletions: Vec<DeletionRecord> = self
            .tables
            .lock()
            .deleted
            .iter()
            .filter(|deletion| deletion.chat_id == chat_id)
            .cloned()
            .collect();
        deletions.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        deletions.truncate(limit);
        deletions
    }

    pub fn deletions_for_message(&self, message_id: &str) -> Vec<DeletionRecord> {
        self.tables
            .lock()
            .deleted
            .iter()
            .filter(|deletion| deletion.original_message_id == message_id)
            .cloned()
            .collect()
    }

    /// Snapshot of every archived record
    pub fn records(&self) -> Vec<MessageRecord> {
        self.tables.lock().messages.values().cloned().collect()
    }

    /// Media files referenced by surviving records
    pub fn media_refs(&self) -> HashSet<String> {
        self.tables
            .lock()
            .messages
            .values()
            .filter_map(|record| record.media.as_ref())
            .map(|media| media.relative_path.clone())
            .collect()
    }

    /// Remove records and their deletion snapshots. Returns the removed
    /// records; nothing is removed if persistence fails.
    pub fn remove_many(&self, ids: &HashSet<String>) -> Vec<MessageRecord> {
        if ids.is_empty() {
            return Vec::new();
        }

        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let removed: Vec<MessageRecord> = ids
            .iter()
            .filter_map(|id| tables.messages.remove(id))
            .collect();
        if removed.is_empty() {
            return removed;
        }

        let (dropped, kept): (Vec<DeletionRecord>, Vec<DeletionRecord>) =
            std::mem::take(&mut tables.deleted)
                .into_iter()
                .partition(|deletion| ids.contains(&deletion.original_message_id));
        tables.deleted = kept;

        if let Err(e) = self.messages_doc.save_with_retry(&tables.messages) {
            error!("Failed to remove {} records: {}", removed.len(), e);
            Self::restore_removed(tables, removed, dropped);
            return Vec::new();
        }
        if let Err(e) = self.deleted_doc.save_with_retry(&tables.deleted) {
            error!("Failed to drop deletion snapshots of {} records: {}", removed.len(), e);
            Self::restore_removed(tables, removed, dropped);
            if let Err(e) = self.messages_doc.save_with_retry(&tables.messages) {
                error!("Failed to restore records after aborted removal: {}", e);
            }
            return Vec::new();
        }

        debug!(
            "Removed {} records and {} deletion snapshots",
            removed.len(),
            dropped.len()
        );
        removed
    }

    fn restore_removed(
        tables: &mut Tables,
        removed: Vec<MessageRecord>,
        dropped: Vec<DeletionRecord>,
    ) {
        for record in removed {
            tables.messages.insert(record.id.clone(), record);
        }
        tables.deleted.extend(dropped);
    }

    pub fn len(&self) -> usize {
        self.tables.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist both tables as they are in memory
    pub fn flush(&self) -> Result<()> {
        let tables = self.tables.lock();
        self.messages_doc.save_with_retry(&tables.messages)?;
        self.deleted_doc.save_with_retry(&tables.deleted)
    }
}

fn sort_newest_first(records: &mut [MessageRecord]) {
    records.sort_by(|a, b| {
        b.originated_at
            .cmp(&a.originated_at)
            .then_with(|| b.ingested_at.cmp(&a.ingested_at))
    });
}

fn build_record(raw: &RawMessage, ingested_at: DateTime<Utc>) -> MessageRecord {
    let text_content = content::extract_text(&raw.content);
    let kind = content::classify(&raw.content).unwrap_or(MessageKind::Text);
    let is_voice_note = kind == MessageKind::Audio
        && content::media_payload(&raw.content, kind).is_some_and(|media| media.ptt);
    let reply = content::reply_context(&raw.content);

    MessageRecord {
        id: raw.id.clone(),
        chat_id: raw.chat_id.clone(),
        sender_id: raw.sender_id.clone(),
        participant_id: raw.participant_id.clone(),
        kind,
        text_content,
        media: None,
        originated_at: Utc
            .timestamp_opt(raw.timestamp, 0)
            .single()
            .unwrap_or(ingested_at),
        ingested_at,
        from_self: raw.from_self,
        is_group: raw.is_group(),
        is_business: raw.is_business,
        is_voice_note,
        is_edited: raw.is_edit(),
        deleted: false,
        quoted_context: reply.and_then(|context| context.quoted_message.clone()),
        quoted_original_id: reply.and_then(|context| context.quoted_id.clone()),
    }
}
