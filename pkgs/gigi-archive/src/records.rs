//! Persisted record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an archived message, selected by content priority at ingestion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Protocol,
}

impl MessageKind {
    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Video
                | MessageKind::Audio
                | MessageKind::Document
                | MessageKind::Sticker
        )
    }
}

/// Conversation target class used to select a retention policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatClass {
    Status,
    Channel,
    Group,
    Private,
}

impl ChatClass {
    /// Classify a chat by its address. Unknown servers have no class.
    pub fn classify(chat_id: &str) -> Option<Self> {
        if chat_id == "status@broadcast" {
            return Some(ChatClass::Status);
        }
        let (_, server) = chat_id.rsplit_once('@')?;
        match server {
            "newsletter" | "broadcast" => Some(ChatClass::Channel),
            "g.us" => Some(ChatClass::Group),
            "s.whatsapp.net" | "c.us" | "lid" => Some(ChatClass::Private),
            _ => None,
        }
    }

    /// Status and channel chats are one-to-many broadcasts
    pub fn is_broadcast(self) -> bool {
        matches!(self, ChatClass::Status | ChatClass::Channel)
    }
}

/// Stored attachment belonging to exactly one message record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRecord {
    /// Path relative to the media root
    pub relative_path: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub original_file_name: String,
    pub duration_seconds: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Archived message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub participant_id: Option<String>,
    pub kind: MessageKind,
    pub text_content: Option<String>,
    pub media: Option<MediaRecord>,
    pub originated_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,

    pub from_self: bool,
    pub is_group: bool,
    pub is_business: bool,
    pub is_voice_note: bool,
    pub is_edited: bool,
    pub deleted: bool,

    pub quoted_context: Option<Value>,
    pub quoted_original_id: Option<String>,
}

/// Snapshot appended when a deletion is correlated to an archived message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletionRecord {
    pub original_message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content_snapshot: Option<String>,
    pub media_snapshot: Option<MediaRecord>,
    pub deleted_at: DateTime<Utc>,
}

impl DeletionRecord {
    pub fn snapshot(record: &MessageRecord, deleted_at: DateTime<Utc>) -> Self {
        Self {
            original_message_id: record.id.clone(),
            chat_id: record.chat_id.clone(),
            sender_id: record.sender_id.clone(),
            kind: record.kind,
            content_snapshot: record.text_content.clone(),
            media_snapshot: record.media.clone(),
            deleted_at,
        }
    }
}

/// Heuristic link from an edited message to the message it replaced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditMapping {
    pub edited_id: String,
    pub original_id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
}

/// Reply context kept for an edited message so "replying to" can be rebuilt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextBackup {
    pub message_id: String,
    pub context: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContextBackup {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
