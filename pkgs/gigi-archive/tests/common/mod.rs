// Copyright 2024 Gigi Team.
//
// Shared fakes and builders for gigi-archive integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gigi_archive::{
    AlertSink, ContentPart, DeletionAlert, ExtendedText, MediaFetcher, MediaPayload,
    MessageKind, MessageStore, RawMessage,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub const PRIVATE_CHAT: &str = "15550001111@s.whatsapp.net";
pub const GROUP_CHAT: &str = "120363041234567890@g.us";
pub const STATUS_CHAT: &str = "status@broadcast";
pub const CHANNEL_CHAT: &str = "120363999999999999@newsletter";
pub const SENDER: &str = "15550002222@s.whatsapp.net";
pub const BOT_ID: &str = "15559990000:7@s.whatsapp.net";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fetcher that fails a fixed number of times before returning `payload`
pub struct FakeFetcher {
    payload: Bytes,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FakeFetcher {
    pub fn new(payload: &'static [u8]) -> Self {
        Self::failing(payload, 0)
    }

    pub fn failing(payload: &'static [u8], failures: u32) -> Self {
        Self {
            payload: Bytes::from_static(payload),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, _message: &RawMessage, _kind: MessageKind) -> anyhow::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("media server unavailable");
        }
        Ok(self.payload.clone())
    }
}

/// Sink recording every delivered alert
#[derive(Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<DeletionAlert>>,
}

impl RecordingSink {
    pub fn alerts(&self) -> Vec<DeletionAlert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, alert: DeletionAlert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}

pub fn raw(id: &str, chat: &str, content: Vec<ContentPart>) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        chat_id: chat.to_string(),
        sender_id: SENDER.to_string(),
        participant_id: None,
        from_self: false,
        timestamp: chrono::Utc::now().timestamp(),
        is_business: false,
        content,
    }
}

pub fn text(id: &str, chat: &str, body: &str) -> RawMessage {
    raw(
        id,
        chat,
        vec![ContentPart::Conversation {
            text: body.to_string(),
        }],
    )
}

pub fn image(id: &str, chat: &str) -> RawMessage {
    raw(
        id,
        chat,
        vec![ContentPart::Image(MediaPayload {
            mime_type: Some("image/jpeg".to_string()),
            caption: Some("look at this".to_string()),
            width: Some(640),
            height: Some(480),
            ..Default::default()
        })],
    )
}

pub fn voice_note(id: &str, chat: &str) -> RawMessage {
    raw(
        id,
        chat,
        vec![ContentPart::Audio(MediaPayload {
            mime_type: Some("audio/ogg; codecs=opus".to_string()),
            seconds: Some(4),
            ptt: true,
            ..Default::default()
        })],
    )
}

pub fn edited(id: &str, chat: &str, body: &str) -> RawMessage {
    raw(
        id,
        chat,
        vec![ContentPart::Edited {
            content: vec![ContentPart::ExtendedText(ExtendedText {
                text: body.to_string(),
                context: None,
            })],
        }],
    )
}

/// Poll until the record has media attached or `timeout` passes
pub async fn wait_for_media(store: &MessageStore, id: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if store.get_media(id).is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
