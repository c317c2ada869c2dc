//! Gigi Archive - Message archive and deletion recovery for chat bots
//!
//! This crate durably records every message a bot observes, links later
//! deletion and edit signals back to the archived message, and applies
//! tiered retention to records and media.
//!
//! # Architecture
//!
//! - **MessageStore**: Archived messages and the deletion log
//! - **MediaStore**: Attachment files, downloaded on a bounded pool
//! - **EditCorrelator**: Edited message to original message mappings
//! - **DeletionCorrelator**: Deletion signals to alerts
//! - **RetentionManager**: Periodic TTL eviction and orphan media cleanup
//! - **SettingStore**: Key-value settings, one file per key
//! - **Archive**: Facade wiring all of the above
//!
//! # Storage Layout
//!
//! Everything lives under `ArchiveConfig::data_dir` as plain JSON documents,
//! written to a temp file and renamed into place:
//!
//! - `messages.json`: Archived messages keyed by id
//! - `deleted.json`: Deletion snapshots
//! - `edits.json`: Edit mappings
//! - `context_backups.json`: Reply contexts of edited messages, with TTL
//! - `settings/<key>.json`: One file per setting
//! - `media/`: Attachment files
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use gigi_archive::{Archive, ArchiveConfig, DeletionSignal};
//! # use std::sync::Arc;
//! # async fn example(
//! #     fetcher: Arc<dyn gigi_archive::MediaFetcher>,
//! #     sink: Arc<dyn gigi_archive::AlertSink>,
//! #     message: gigi_archive::RawMessage,
//! # ) -> anyhow::Result<()> {
//! let config = ArchiveConfig {
//!     data_dir: "bot-data".into(),
//!     ..Default::default()
//! };
//! let archive = Archive::open(config, fetcher, sink).await?;
//! archive.start_retention();
//!
//! let report = archive.ingest(&message);
//! if let Some(signal) = report.deletion {
//!     archive.handle_deletion(signal).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod content;
pub mod deletion_correlator;
pub mod document;
pub mod edit_correlator;
pub mod error;
pub mod events;
pub mod media_store;
pub mod message_store;
pub mod records;
pub mod retention;
pub mod settings_store;

pub use archive::{Archive, IngestReport};
pub use deletion_correlator::{
    AlertContent, AlertSink, CorrelatorTiming, DeletionAlert, DeletionCorrelator,
    DeletionOutcome, DeletionSignal, DeletionTarget,
};
pub use edit_correlator::EditCorrelator;
pub use error::{ArchiveError, MediaError, Result};
pub use events::{
    ContentPart, ExtendedText, MediaPayload, ProtocolPayload, ProtocolType, RawMessage,
    ReplyContext,
};
pub use media_store::{MediaFetcher, MediaPatch, MediaPool, MediaStore};
pub use message_store::MessageStore;
pub use records::{
    ChatClass, ContextBackup, DeletionRecord, EditMapping, MediaRecord, MessageKind,
    MessageRecord,
};
pub use retention::{PolicyHandle, RetentionManager, RetentionPolicy, SweepReport};
pub use settings_store::SettingStore;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding every persisted document
    pub data_dir: PathBuf,

    /// Media directory (default: `<data_dir>/media`)
    pub media_dir: Option<PathBuf>,

    /// Wait before the first lookup of a deleted message (default: 3000ms)
    pub settle_delay_ms: u64,

    /// Wait before the single retry lookup (default: 8000ms)
    pub retry_delay_ms: u64,

    /// Backoff between media download attempts (default: 2000ms)
    pub media_retry_backoff_ms: u64,

    /// Maximum concurrent media downloads (default: 4)
    pub max_concurrent_downloads: usize,

    /// Interval in seconds for retention sweeps (default: 3600s)
    pub cleanup_interval_seconds: u64,

    /// Recent messages inspected per edit (default: 10)
    pub edit_scan_window: usize,

    /// The bot's own user ids, used to recognise self-chats
    pub self_ids: Vec<String>,

    /// Initial retention policy; a policy saved in settings takes precedence
    pub policy: RetentionPolicy,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("gigi-archive"),
            media_dir: None,
            settle_delay_ms: 3000,
            retry_delay_ms: 8000,
            media_retry_backoff_ms: 2000,
            max_concurrent_downloads: 4,
            cleanup_interval_seconds: 3600,
            edit_scan_window: edit_correlator::DEFAULT_SCAN_WINDOW,
            self_ids: Vec::new(),
            policy: RetentionPolicy::default(),
        }
    }
}

impl ArchiveConfig {
    pub fn media_root(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"))
    }

    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}
