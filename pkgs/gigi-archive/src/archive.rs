//! Archive facade - wires the stores, correlators and retention together

use crate::deletion_correlator::{
    AlertSink, CorrelatorTiming, DeletionCorrelator, DeletionOutcome, DeletionSignal,
};
use crate::edit_correlator::EditCorrelator;
use crate::events::RawMessage;
use crate::media_store::{MediaFetcher, MediaPool, MediaStore};
use crate::message_store::MessageStore;
use crate::records::{DeletionRecord, EditMapping, MediaRecord, MessageRecord};
use crate::retention::{PolicyHandle, RetentionManager, RetentionPolicy, SweepReport};
use crate::settings_store::{SettingStore, RETENTION_POLICY_KEY};
use crate::ArchiveConfig;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SETTINGS_DIR: &str = "settings";

/// The orphan sweep deletes every unreferenced file directly under the media
/// root, so the root must not be a directory holding persisted documents.
async fn check_media_root(config: &ArchiveConfig) -> Result<()> {
    let media_root = config.media_root();
    tokio::fs::create_dir_all(&media_root)
        .await
        .with_context(|| format!("Failed to create media dir {}", media_root.display()))?;
    let media_root = tokio::fs::canonicalize(&media_root)
        .await
        .with_context(|| format!("Failed to resolve media dir {}", media_root.display()))?;
    let data_dir = tokio::fs::canonicalize(&config.data_dir)
        .await
        .with_context(|| format!("Failed to resolve data dir {}", config.data_dir.display()))?;

    if media_root == data_dir || media_root == data_dir.join(SETTINGS_DIR) {
        anyhow::bail!(
            "Media dir {} must not be the data dir or its settings dir",
            media_root.display()
        );
    }
    Ok(())
}

/// What happened to one ingested message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// False only when persistence failed
    pub archived: bool,
    /// Set when the message is an edit matched to an earlier message
    pub edit: Option<EditMapping>,
    /// Revoke carried by the message, to be passed to
    /// [`Archive::handle_deletion`]
    pub deletion: Option<DeletionSignal>,
}

pub struct Archive {
    config: ArchiveConfig,
    store: Arc<MessageStore>,
    media: Arc<MediaStore>,
    edits: Arc<EditCorrelator>,
    deletions: DeletionCorrelator,
    settings: Arc<SettingStore>,
    retention: Arc<RetentionManager>,
    timer: Mutex<Option<JoinHandle<()>>>,
    patch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Archive {
    /// Open every store under `config.data_dir`. Must be called inside a
    /// tokio runtime.
    pub async fn open(
        config: ArchiveConfig,
        fetcher: Arc<dyn MediaFetcher>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
        check_media_root(&config).await?;

        let settings = Arc::new(SettingStore::open(&config.data_dir.join(SETTINGS_DIR)));
        let policy = match settings.get_json::<RetentionPolicy>(RETENTION_POLICY_KEY) {
            Some(saved) => {
                info!("Restored retention policy from settings");
                saved
            }
            None => config.policy,
        };
        let policy = PolicyHandle::new(policy);

        let media = Arc::new(MediaStore::new(
            config.media_root(),
            fetcher,
            Duration::from_millis(config.media_retry_backoff_ms),
        ));
        let (pool, patches) = MediaPool::new(Arc::clone(&media), config.max_concurrent_downloads);
        let store = Arc::new(MessageStore::with_media_pool(&config.data_dir, pool));
        let patch_task = tokio::spawn(
            Arc::clone(&store).apply_media_patches(Arc::clone(&media), patches),
        );

        let edits = Arc::new(EditCorrelator::open(
            &config.data_dir,
            Arc::clone(&store),
            policy.clone(),
            config.edit_scan_window,
        ));
        let deletions = DeletionCorrelator::new(
            Arc::clone(&store),
            Arc::clone(&media),
            sink,
            CorrelatorTiming {
                settle_delay: Duration::from_millis(config.settle_delay_ms),
                retry_delay: Duration::from_millis(config.retry_delay_ms),
            },
            config.self_ids.clone(),
        );
        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&store),
            Arc::clone(&media),
            Arc::clone(&edits),
            Arc::clone(&settings),
            policy,
        ));

        info!("Archive opened at {}", config.data_dir.display());
        Ok(Self {
            config,
            store,
            media,
            edits,
            deletions,
            settings,
            retention,
            timer: Mutex::new(None),
            patch_task: Mutex::new(Some(patch_task)),
        })
    }

    /// Archive a message and correlate it if it is an edit
    pub fn ingest(&self, raw: &RawMessage) -> IngestReport {
        let archived = self.store.archive(raw);
        let edit = if archived && raw.is_edit() {
            self.edits.correlate(raw)
        } else {
            None
        };
        IngestReport {
            archived,
            edit,
            deletion: DeletionSignal::from_raw(raw),
        }
    }

    pub async fn handle_deletion(&self, signal: DeletionSignal) -> DeletionOutcome {
        self.deletions.handle(signal).await
    }

    pub fn get(&self, message_id: &str) -> Option<MessageRecord> {
        self.store.get(message_id)
    }

    /// Media descriptor of a message with the absolute path of its file
    pub fn get_media(&self, message_id: &str) -> Option<(MediaRecord, PathBuf)> {
        let media = self.store.get_media(message_id)?;
        let path = self.media.path_of(&media.relative_path);
        Some((media, path))
    }

    pub fn recent_deletions(&self, limit: usize) -> Vec<DeletionRecord> {
        self.store.recent_deletions(limit)
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn media(&self) -> &Arc<MediaStore> {
        &self.media
    }

    pub fn edits(&self) -> &Arc<EditCorrelator> {
        &self.edits
    }

    pub fn settings(&self) -> &Arc<SettingStore> {
        &self.settings
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    /// Start the periodic retention sweep at the configured interval
    pub fn start_retention(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds.max(1));
        *timer = Some(self.retention.start(interval));
        info!("Retention sweep scheduled every {:?}", interval);
    }

    pub async fn sweep(&self) -> Option<SweepReport> {
        self.retention.sweep().await
    }

    /// Stop retention, wait up to `timeout` for a running sweep and flush
    /// the tables. Downloads still in progress are abandoned; their files
    /// are collected by the next orphan sweep.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let idle = self.retention.shutdown(timeout).await;
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }
        let patch_task = self.patch_task.lock().take();
        if let Some(task) = patch_task {
            task.abort();
        }
        if let Err(e) = self.store.flush() {
            warn!("Failed to flush archive on shutdown: {}", e);
            return false;
        }
        info!("Archive shut down");
        idle
    }
}
