//! Raw event types delivered by the chat network collaborator

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply metadata carried by text and media payloads
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplyContext {
    pub quoted_id: Option<String>,
    pub quoted_sender: Option<String>,
    /// Opaque snapshot of the quoted message as the network delivered it
    pub quoted_message: Option<Value>,
}

/// Text payload with optional reply metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtendedText {
    pub text: String,
    pub context: Option<ReplyContext>,
}

/// Attachment descriptor shared by every media content type
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaPayload {
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    pub file_length: Option<u64>,
    pub seconds: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Push-to-talk flag, set on audio recorded as a voice note
    #[serde(default)]
    pub ptt: bool,
    pub context: Option<ReplyContext>,
}

/// Protocol message discriminator; the network sends either form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProtocolType {
    Numeric(i64),
    Named(String),
}

/// Numeric protocol types that only carry device sync chatter
const SYNC_NOISE_CODES: &[i64] = &[3, 4, 5, 6, 7, 8, 9, 10, 16, 17];

/// Named protocol types that only carry device sync chatter
const SYNC_NOISE_NAMES: &[&str] = &[
    "EPHEMERAL_SETTING",
    "EPHEMERAL_SYNC_RESPONSE",
    "HISTORY_SYNC_NOTIFICATION",
    "APP_STATE_SYNC_KEY_SHARE",
    "APP_STATE_SYNC_KEY_REQUEST",
    "MSG_FANOUT_BACKFILL_REQUEST",
    "INITIAL_SECURITY_NOTIFICATION_SETTING_SYNC",
    "APP_STATE_FATAL_EXCEPTION_NOTIFICATION",
    "PEER_DATA_OPERATION_REQUEST_MESSAGE",
    "PEER_DATA_OPERATION_REQUEST_RESPONSE_MESSAGE",
];

/// Numeric discriminator of a revoke ("delete for everyone") protocol message
pub const PROTOCOL_REVOKE: i64 = 0;

/// Named discriminator of a revoke protocol message
pub const PROTOCOL_REVOKE_NAME: &str = "REVOKE";

impl ProtocolType {
    pub fn is_revoke(&self) -> bool {
        match self {
            ProtocolType::Numeric(code) => *code == PROTOCOL_REVOKE,
            ProtocolType::Named(name) => name.eq_ignore_ascii_case(PROTOCOL_REVOKE_NAME),
        }
    }

    pub fn is_sync_noise(&self) -> bool {
        match self {
            ProtocolType::Numeric(code) => SYNC_NOISE_CODES.contains(code),
            ProtocolType::Named(name) => SYNC_NOISE_NAMES
                .iter()
                .any(|noise| name.eq_ignore_ascii_case(noise)),
        }
    }
}

/// Protocol (system) message payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolPayload {
    pub protocol_type: ProtocolType,
    /// Id of the message this protocol message acts on
    pub target_id: Option<String>,
    pub target_chat_id: Option<String>,
}

/// One content type present on a raw message.
///
/// A message usually carries a single part, but edited-message wrappers and
/// some system messages legitimately carry several.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Conversation { text: String },
    ExtendedText(ExtendedText),
    Image(MediaPayload),
    Video(MediaPayload),
    Audio(MediaPayload),
    Document(MediaPayload),
    Sticker(MediaPayload),
    Protocol(ProtocolPayload),
    Reaction { target_id: String, emoji: String },
    Receipt,
    PollUpdate,
    /// Edited-message wrapper around the replacement content
    Edited { content: Vec<ContentPart> },
}

/// Raw message event as observed on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub participant_id: Option<String>,
    pub from_self: bool,
    /// Seconds since the Unix epoch at which the message was sent
    pub timestamp: i64,
    #[serde(default)]
    pub is_business: bool,
    pub content: Vec<ContentPart>,
}

impl RawMessage {
    /// Group chats are addressed with the `@g.us` server
    pub fn is_group(&self) -> bool {
        self.chat_id.ends_with("@g.us")
    }

    /// Replacement content when this message is an edit
    pub fn edited_content(&self) -> Option<&[ContentPart]> {
        self.content.iter().find_map(|part| match part {
            ContentPart::Edited { content } => Some(content.as_slice()),
            _ => None,
        })
    }

    pub fn is_edit(&self) -> bool {
        self.edited_content().is_some()
    }
}
