//! Deletion correlator - maps deletion signals back to archived messages and
//! raises alerts for recovered content
//!
//! Each signal runs through its own short state machine:
//! filter by chat class, settle delay, lookup, one delayed retry on a miss,
//! then alert and mark the record deleted, or send a degraded alert when the
//! content cannot be recovered. Nothing is kept between signals except the
//! set of message ids currently being processed.

use crate::content;
use crate::events::{ContentPart, ProtocolType, RawMessage};
use crate::media_store::MediaStore;
use crate::message_store::MessageStore;
use crate::records::{ChatClass, MessageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stub code of a message revoked by its sender
pub const STUB_REVOKE: i32 = 1;

/// Stub code of a group message revoked by an admin
pub const STUB_ADMIN_REVOKE: i32 = 68;

/// Alternate revoke stub code sent by newer clients
pub const STUB_REVOKE_ALT: i32 = 132;

/// Deletion signal as delivered by the network collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum DeletionSignal {
    /// Message update carrying a stub code in place of content
    Stub {
        code: i32,
        message_id: String,
        chat_id: String,
    },
    /// Protocol message revoking an earlier message
    Protocol {
        protocol_type: ProtocolType,
        target_id: String,
        chat_id: String,
    },
}

/// Canonical deletion target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeletionTarget {
    pub message_id: String,
    pub chat_id: String,
}

impl DeletionSignal {
    /// Reduce the signal to (message id, chat id); `None` if it is not a
    /// deletion at all
    pub fn normalize(&self) -> Option<DeletionTarget> {
        let (message_id, chat_id) = match self {
            DeletionSignal::Stub {
                code,
                message_id,
                chat_id,
            } if matches!(*code, STUB_REVOKE | STUB_ADMIN_REVOKE | STUB_REVOKE_ALT) => {
                (message_id, chat_id)
            }
            DeletionSignal::Protocol {
                protocol_type,
                target_id,
                chat_id,
            } if protocol_type.is_revoke() => (target_id, chat_id),
            _ => return None,
        };
        if message_id.is_empty() || chat_id.is_empty() {
            return None;
        }
        Some(DeletionTarget {
            message_id: message_id.clone(),
            chat_id: chat_id.clone(),
        })
    }

    /// Extract the revoke carried by an ingested protocol message
    pub fn from_raw(raw: &RawMessage) -> Option<Self> {
        if !content::is_revoke(&raw.content) {
            return None;
        }
        raw.content.iter().find_map(|part| match part {
            ContentPart::Protocol(protocol) if protocol.protocol_type.is_revoke() => {
                Some(DeletionSignal::Protocol {
                    protocol_type: protocol.protocol_type.clone(),
                    target_id: protocol.target_id.clone()?,
                    chat_id: protocol
                        .target_chat_id
                        .clone()
                        .unwrap_or_else(|| raw.chat_id.clone()),
                })
            }
            _ => None,
        })
    }
}

/// What an alert reports about the deleted message
#[derive(Debug, Clone, PartialEq)]
pub enum AlertContent {
    /// The archived record, with the path of its media if it was captured
    Recovered {
        record: MessageRecord,
        media_path: Option<PathBuf>,
    },
    /// Deletion detected, content unrecoverable
    Unrecoverable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletionAlert {
    pub message_id: String,
    pub chat_id: String,
    pub detected_at: DateTime<Utc>,
    pub content: AlertContent,
}

/// Delivers deletion alerts; retries are the implementor's concern
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: DeletionAlert) -> anyhow::Result<()>;
}

/// Terminal state of one processed signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    NotADeletion,
    /// Status and channel chats are never reported
    ExcludedChat,
    /// Another signal for the same message is being processed
    Duplicate,
    AlreadyDeleted,
    /// Alert sent and record marked deleted
    Alerted,
    /// Deleted by the bot itself: marked deleted, no alert
    SelfDeletion,
    /// Never archived; `alerted` is false for self-chats
    Unrecoverable { alerted: bool },
}

/// Timing for the settle delay and the single retry lookup
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorTiming {
    pub settle_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for CorrelatorTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(3000),
            retry_delay: Duration::from_millis(8000),
        }
    }
}

/// Strip the server and device parts of an address
fn user_part(address: &str) -> &str {
    let user = address.split('@').next().unwrap_or(address);
    user.split(':').next().unwrap_or(user)
}

pub struct DeletionCorrelator {
    store: Arc<MessageStore>,
    media: Arc<MediaStore>,
    sink: Arc<dyn AlertSink>,
    timing: CorrelatorTiming,
    self_ids: Vec<String>,
    in_progress: Mutex<HashSet<String>>,
}

/// Releases a claimed message id when processing ends
struct Claim<'a> {
    in_progress: &'a Mutex<HashSet<String>>,
    message_id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_progress.lock().remove(&self.message_id);
    }
}

impl DeletionCorrelator {
    pub fn new(
        store: Arc<MessageStore>,
        media: Arc<MediaStore>,
        sink: Arc<dyn AlertSink>,
        timing: CorrelatorTiming,
        self_ids: Vec<String>,
    ) -> Self {
        Self {
            store,
            media,
            sink,
            timing,
            self_ids,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// A chat with the bot's own account, where nobody else could delete
    pub fn is_self_chat(&self, chat_id: &str) -> bool {
        let user = user_part(chat_id);
        !user.is_empty() && self.self_ids.iter().any(|id| user_part(id) == user)
    }

    fn claim(&self, message_id: &str) -> Option<Claim<'_>> {
        if !self.in_progress.lock().insert(message_id.to_string()) {
            return None;
        }
        Some(Claim {
            in_progress: &self.in_progress,
            message_id: message_id.to_string(),
        })
    }

    async fn lookup(&self, message_id: &str) -> Option<MessageRecord> {
        tokio::time::sleep(self.timing.settle_delay).await;
        if let Some(record) = self.store.get(message_id) {
            return Some(record);
        }
        debug!("Message {} not archived yet, retrying once", message_id);
        tokio::time::sleep(self.timing.retry_delay).await;
        self.store.get(message_id)
    }

    async fn send(&self, alert: DeletionAlert) {
        let message_id = alert.message_id.clone();
        if let Err(e) = self.sink.deliver(alert).await {
            warn!("Failed to deliver deletion alert for {}: {}", message_id, e);
        }
    }

    /// Process one deletion signal to completion
    pub async fn handle(&self, signal: DeletionSignal) -> DeletionOutcome {
        let Some(target) = signal.normalize() else {
            return DeletionOutcome::NotADeletion;
        };
        if ChatClass::classify(&target.chat_id).is_some_and(ChatClass::is_broadcast) {
            debug!("Ignoring deletion in broadcast chat {}", target.chat_id);
            return DeletionOutcome::ExcludedChat;
        }
        let Some(_claim) = self.claim(&target.message_id) else {
            debug!("Deletion of {} already in progress", target.message_id);
            return DeletionOutcome::Duplicate;
        };

        let Some(record) = self.lookup(&target.message_id).await else {
            if self.is_self_chat(&target.chat_id) {
                debug!("Unrecoverable deletion of {} in self chat", target.message_id);
                return DeletionOutcome::Unrecoverable { alerted: false };
            }
            info!(
                "Deleted message {} in {} was never archived",
                target.message_id, target.chat_id
            );
            self.send(DeletionAlert {
                message_id: target.message_id,
                chat_id: target.chat_id,
                detected_at: Utc::now(),
                content: AlertContent::Unrecoverable,
            })
            .await;
            return DeletionOutcome::Unrecoverable { alerted: true };
        };

        if record.deleted {
            return DeletionOutcome::AlreadyDeleted;
        }
        if record.from_self {
            self.store.mark_deleted(&target.message_id, &target.chat_id);
            return DeletionOutcome::SelfDeletion;
        }

        let media_path = record
            .media
            .as_ref()
            .map(|media| self.media.path_of(&media.relative_path));
        info!(
            "Recovered deleted message {} from {} in {}",
            record.id, record.sender_id, record.chat_id
        );
        self.send(DeletionAlert {
            message_id: target.message_id.clone(),
            chat_id: target.chat_id.clone(),
            detected_at: Utc::now(),
            content: AlertContent::Recovered { record, media_path },
        })
        .await;
        self.store.mark_deleted(&target.message_id, &target.chat_id);
        DeletionOutcome::Alerted
    }
}
