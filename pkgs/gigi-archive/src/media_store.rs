//! Media side-store - downloads and keeps attachments of archived messages

use crate::content;
use crate::error::MediaError;
use crate::events::{MediaPayload, RawMessage};
use crate::records::{ChatClass, MediaRecord, MessageKind};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Source of attachment bytes, implemented by the chat network connection
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, message: &RawMessage, kind: MessageKind) -> anyhow::Result<Bytes>;
}

/// MIME essence to file extension, checked before `mime_guess`
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
    ("video/mp4", "mp4"),
    ("video/3gpp", "3gp"),
    ("video/quicktime", "mov"),
    ("audio/ogg", "ogg"),
    ("audio/mpeg", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/aac", "aac"),
    ("audio/amr", "amr"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("text/plain", "txt"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xlsx",
    ),
];

/// Resolve a file extension from the MIME type, falling back per kind
pub fn extension_for(mime_type: Option<&str>, kind: MessageKind) -> String {
    let essence = mime_type
        .and_then(|mime| mime.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty());

    if let Some(essence) = essence {
        if let Some((_, ext)) = MIME_EXTENSIONS.iter().find(|(mime, _)| *mime == essence) {
            return ext.to_string();
        }
        if let Some(ext) = mime_guess::get_mime_extensions_str(&essence).and_then(|exts| exts.first())
        {
            return ext.to_string();
        }
    }

    match kind {
        MessageKind::Image => "jpg",
        MessageKind::Video => "mp4",
        MessageKind::Audio => "ogg",
        MessageKind::Sticker => "webp",
        MessageKind::Document | MessageKind::Text | MessageKind::Protocol => "bin",
    }
    .to_string()
}

fn default_mime(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Image => "image/jpeg",
        MessageKind::Video => "video/mp4",
        MessageKind::Audio => "audio/ogg",
        MessageKind::Sticker => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Download attempts allowed per kind; voice notes and video get the most
pub fn attempt_budget(kind: MessageKind, is_voice_note: bool) -> u32 {
    match kind {
        MessageKind::Audio if is_voice_note => 5,
        MessageKind::Video => 4,
        MessageKind::Audio | MessageKind::Document => 3,
        MessageKind::Image => 2,
        _ => 1,
    }
}

/// Keep message ids safe to embed in a file name
pub fn sanitize_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// Result of an orphan sweep over the media root
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OrphanSweep {
    pub removed: usize,
    pub errors: usize,
}

/// Media side-store rooted at one directory
pub struct MediaStore {
    root: PathBuf,
    fetcher: Arc<dyn MediaFetcher>,
    retry_backoff: Duration,
    /// Files written but not yet attached to their record
    in_flight: Mutex<HashSet<String>>,
}

impl MediaStore {
    /// Create a media store; the root directory is created if missing
    pub fn new(root: PathBuf, fetcher: Arc<dyn MediaFetcher>, retry_backoff: Duration) -> Self {
        if let Err(e) = fs::create_dir_all(&root) {
            error!("Failed to create media root {}: {}", root.display(), e);
        }
        info!("Media store initialized at {}", root.display());
        Self {
            root,
            fetcher,
            retry_backoff,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.path_of(relative_path).is_file()
    }

    /// Download the attachment of `raw` and store it under the media root.
    ///
    /// Broadcast chats fail fast; other failures are retried within the
    /// kind's attempt budget with a fixed backoff. The stored file is an
    /// orphan to [`sweep_orphans`](Self::sweep_orphans) until a record
    /// references it.
    pub async fn download(
        &self,
        raw: &RawMessage,
        kind: MessageKind,
    ) -> Result<MediaRecord, MediaError> {
        let media = self.download_tracked(raw, kind).await?;
        self.settle(&media.relative_path);
        Ok(media)
    }

    /// Like [`download`](Self::download), but the stored file stays in
    /// flight, and safe from the orphan sweep, until [`settle`](Self::settle)
    /// is called for it.
    pub async fn download_tracked(
        &self,
        raw: &RawMessage,
        kind: MessageKind,
    ) -> Result<MediaRecord, MediaError> {
        if ChatClass::classify(&raw.chat_id).is_some_and(ChatClass::is_broadcast) {
            return Err(MediaError::Unsupported(raw.chat_id.clone()));
        }
        let payload = content::media_payload(&raw.content, kind)
            .ok_or_else(|| MediaError::NoMedia(raw.id.clone()))?;

        let attempts = attempt_budget(kind, payload.ptt);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.fetcher.fetch(raw, kind).await {
                Ok(bytes) if !bytes.is_empty() => {
                    return self.write(raw, kind, payload, &bytes).await;
                }
                Ok(_) => last_error = "empty payload".to_string(),
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                "Media download for {} failed (attempt {}/{}): {}",
                raw.id, attempt, attempts, last_error
            );
            if attempt < attempts {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        Err(MediaError::Fetch {
            attempts,
            last_error,
        })
    }

    async fn write(
        &self,
        raw: &RawMessage,
        kind: MessageKind,
        payload: &MediaPayload,
        bytes: &[u8],
    ) -> Result<MediaRecord, MediaError> {
        let ext = extension_for(payload.mime_type.as_deref(), kind);
        let file_name = format!(
            "{}_{}.{}",
            Utc::now().timestamp_millis(),
            sanitize_id(&raw.id),
            ext
        );
        let path = self.path_of(&file_name);
        let tmp = self.path_of(&format!("{}.part", file_name));

        self.in_flight.lock().insert(file_name.clone());
        let written = async {
            tokio::fs::create_dir_all(&self.root).await?;
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            self.in_flight.lock().remove(&file_name);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Stored media for {} at {}", raw.id, path.display());
        Ok(MediaRecord {
            relative_path: file_name.clone(),
            mime_type: payload
                .mime_type
                .clone()
                .unwrap_or_else(|| default_mime(kind).to_string()),
            byte_size: bytes.len() as u64,
            original_file_name: payload.file_name.clone().unwrap_or(file_name),
            duration_seconds: payload.seconds,
            width: payload.width,
            height: payload.height,
        })
    }

    /// Release a file from in-flight tracking once its record owns it
    pub fn settle(&self, relative_path: &str) {
        self.in_flight.lock().remove(relative_path);
    }

    pub fn is_in_flight(&self, relative_path: &str) -> bool {
        self.in_flight.lock().contains(relative_path)
    }

    /// Delete a stored file. Returns false if it was already gone.
    pub fn remove(&self, relative_path: &str) -> std::io::Result<bool> {
        match fs::remove_file(self.path_of(relative_path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Names of regular files directly under the media root
    pub fn list_files(&self) -> std::io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(files)
    }

    /// Delete every file that no record references and no download owns.
    ///
    /// `referenced` is evaluated after the directory listing and the
    /// in-flight snapshot, so a download attached mid-sweep is never lost.
    pub fn sweep_orphans<F>(&self, referenced: F) -> OrphanSweep
    where
        F: FnOnce() -> HashSet<String>,
    {
        let mut sweep = OrphanSweep::default();
        let files = match self.list_files() {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list media root {}: {}", self.root.display(), e);
                sweep.errors += 1;
                return sweep;
            }
        };
        let in_flight = self.in_flight.lock().clone();
        let referenced = referenced();

        for name in files {
            let owner = name.strip_suffix(".part").unwrap_or(&name);
            if referenced.contains(owner) || in_flight.contains(owner) {
                continue;
            }
            match self.remove(&name) {
                Ok(true) => {
                    debug!("Removed orphan media {}", name);
                    sweep.removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to remove orphan media {}: {}", name, e);
                    sweep.errors += 1;
                }
            }
        }
        sweep
    }
}

/// Completion of a background download, posted back to the message store
#[derive(Debug)]
pub struct MediaPatch {
    pub message_id: String,
    pub result: Result<MediaRecord, MediaError>,
}

/// Bounded pool running media downloads off the ingestion path
#[derive(Clone)]
pub struct MediaPool {
    store: Arc<MediaStore>,
    permits: Arc<Semaphore>,
    patches: mpsc::UnboundedSender<MediaPatch>,
}

impl MediaPool {
    /// Create a pool running at most `max_concurrent` downloads at once.
    /// Completions arrive on the returned receiver.
    pub fn new(
        store: Arc<MediaStore>,
        max_concurrent: usize,
    ) -> (Self, mpsc::UnboundedReceiver<MediaPatch>) {
        let (patches, receiver) = mpsc::unbounded_channel();
        let pool = Self {
            store,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            patches,
        };
        (pool, receiver)
    }

    pub fn store(&self) -> &Arc<MediaStore> {
        &self.store
    }

    /// Queue a download; returns immediately
    pub fn submit(&self, raw: RawMessage, kind: MessageKind) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, skipping media for {}", raw.id);
            return;
        };

        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let patches = self.patches.clone();
        runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = store.download_tracked(&raw, kind).await;
            match &result {
                Ok(media) => debug!("Downloaded media for {}: {}", raw.id, media.relative_path),
                Err(MediaError::Unsupported(chat)) => {
                    warn!("Skipping media for {}: unsupported chat {}", raw.id, chat)
                }
                Err(e) => warn!("Giving up on media for {}: {}", raw.id, e),
            }
            let patch = MediaPatch {
                message_id: raw.id,
                result,
            };
            if let Err(mpsc::error::SendError(patch)) = patches.send(patch) {
                debug!("Media patch receiver closed");
                if let Ok(media) = patch.result {
                    store.settle(&media.relative_path);
                }
            }
        });
    }
}
