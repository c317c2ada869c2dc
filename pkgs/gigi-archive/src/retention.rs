//! Retention manager - periodic eviction of expired records and orphaned media

use crate::edit_correlator::EditCorrelator;
use crate::media_store::MediaStore;
use crate::message_store::MessageStore;
use crate::records::ChatClass;
use crate::settings_store::{SettingStore, RETENTION_POLICY_KEY};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Time-to-live per chat class, in hours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub status_ttl_hours: u64,
    pub channel_ttl_hours: u64,
    pub group_ttl_hours: u64,
    pub private_ttl_hours: u64,
    pub context_backup_ttl_hours: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            status_ttl_hours: 24,
            channel_ttl_hours: 24,
            group_ttl_hours: 72,
            private_ttl_hours: 72,
            context_backup_ttl_hours: 72,
        }
    }
}

/// Upper bound on any TTL, about a century
const MAX_TTL_HOURS: i64 = 24 * 366 * 100;

fn hours(value: u64) -> chrono::Duration {
    let value = i64::try_from(value).unwrap_or(MAX_TTL_HOURS).min(MAX_TTL_HOURS);
    chrono::Duration::hours(value)
}

impl RetentionPolicy {
    pub fn ttl(&self, class: ChatClass) -> chrono::Duration {
        hours(match class {
            ChatClass::Status => self.status_ttl_hours,
            ChatClass::Channel => self.channel_ttl_hours,
            ChatClass::Group => self.group_ttl_hours,
            ChatClass::Private => self.private_ttl_hours,
        })
    }

    pub fn context_backup_ttl(&self) -> chrono::Duration {
        hours(self.context_backup_ttl_hours)
    }
}

/// Shared, runtime-updatable retention policy
#[derive(Debug, Clone, Default)]
pub struct PolicyHandle(Arc<RwLock<RetentionPolicy>>);

impl PolicyHandle {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self(Arc::new(RwLock::new(policy)))
    }

    pub fn current(&self) -> RetentionPolicy {
        *self.0.read()
    }

    pub fn update(&self, policy: RetentionPolicy) {
        *self.0.write() = policy;
    }
}

/// Counts from one retention sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub records_evicted: usize,
    pub media_removed: usize,
    pub orphans_removed: usize,
    pub edit_mappings_pruned: usize,
    pub context_backups_expired: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn total_cleaned(&self) -> usize {
        self.records_evicted
            + self.media_removed
            + self.orphans_removed
            + self.edit_mappings_pruned
            + self.context_backups_expired
    }
}

/// Clears the running flag even if a sweep unwinds
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Retention manager - one sweep at a time, never raises
pub struct RetentionManager {
    store: Arc<MessageStore>,
    media: Arc<MediaStore>,
    edits: Arc<EditCorrelator>,
    settings: Arc<SettingStore>,
    policy: PolicyHandle,
    running: AtomicBool,
    stopping: AtomicBool,
    stop: Notify,
}

impl RetentionManager {
    pub fn new(
        store: Arc<MessageStore>,
        media: Arc<MediaStore>,
        edits: Arc<EditCorrelator>,
        settings: Arc<SettingStore>,
        policy: PolicyHandle,
    ) -> Self {
        Self {
            store,
            media,
            edits,
            settings,
            policy,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy.current()
    }

    /// Replace the policy and persist it. Returns false if only the
    /// in-memory policy could be updated.
    pub fn update_policy(&self, policy: RetentionPolicy) -> bool {
        self.policy.update(policy);
        info!("Retention policy updated: {:?}", policy);
        match self.settings.set_json(RETENTION_POLICY_KEY, &policy) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist retention policy: {}", e);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a sweep now. `None` if another sweep is running or the manager
    /// is shutting down.
    pub async fn sweep(&self) -> Option<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run a sweep treating `now` as the current time
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let _guard = self.try_begin()?;

        let report = self.run_sweep(now).await;
        if report.total_cleaned() > 0 || report.errors > 0 {
            info!(
                "Retention sweep: {} records, {} media, {} orphans, {} edit mappings, {} context backups cleaned ({} errors)",
                report.records_evicted,
                report.media_removed,
                report.orphans_removed,
                report.edit_mappings_pruned,
                report.context_backups_expired,
                report.errors
            );
        }
        Some(report)
    }

    /// Claim the running flag, then check for shutdown. Once `stopping` is
    /// set, every sweep either backs out here or is still holding the flag
    /// when `shutdown` polls it.
    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Retention sweep already running");
            return None;
        }
        let guard = RunningGuard(&self.running);
        if self.stopping.load(Ordering::SeqCst) {
            debug!("Retention manager is shutting down");
            return None;
        }
        Some(guard)
    }

    async fn run_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let policy = self.policy.current();
        let mut report = SweepReport::default();

        let expired: HashSet<String> = self
            .store
            .records()
            .into_iter()
            .filter(|record| match ChatClass::classify(&record.chat_id) {
                Some(class) => record.ingested_at < now - policy.ttl(class),
                None => false,
            })
            .map(|record| record.id)
            .collect();

        let evicted = self.store.remove_many(&expired);
        if evicted.len() < expired.len() {
            report.errors += 1;
        }
        report.records_evicted = evicted.len();

        for record in &evicted {
            let Some(media) = &record.media else {
                continue;
            };
            match self.media.remove(&media.relative_path) {
                Ok(true) => report.media_removed += 1,
                Ok(false) => debug!("Media {} already gone", media.relative_path),
                Err(e) => {
                    warn!("Failed to remove media {}: {}", media.relative_path, e);
                    report.errors += 1;
                }
            }
        }

        let evicted_ids: HashSet<String> = evicted.into_iter().map(|record| record.id).collect();
        report.edit_mappings_pruned = self.edits.prune_messages(&evicted_ids);
        report.context_backups_expired = self.edits.expire_context_backups(now);

        let media = Arc::clone(&self.media);
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || media.sweep_orphans(|| store.media_refs())).await
        {
            Ok(orphans) => {
                report.orphans_removed = orphans.removed;
                report.errors += orphans.errors;
            }
            Err(e) => {
                error!("Orphan sweep task failed: {}", e);
                report.errors += 1;
            }
        }

        report
    }

    /// Sweep every `interval` until [`shutdown`](Self::shutdown) is called
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                if manager.stopping.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = manager.stop.notified() => break,
                }
                if manager.stopping.load(Ordering::Acquire) {
                    break;
                }
                manager.sweep().await;
            }
            debug!("Retention timer stopped");
        })
    }

    /// Stop future sweeps and wait up to `timeout` for a running one.
    /// Returns false if the sweep was still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();

        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                warn!("Retention sweep still running after {:?}", timeout);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawMessage;
    use crate::media_store::MediaFetcher;
    use crate::records::MessageKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct NoFetch;

    #[async_trait]
    impl MediaFetcher for NoFetch {
        async fn fetch(&self, _message: &RawMessage, _kind: MessageKind) -> anyhow::Result<Bytes> {
            anyhow::bail!("no media in this test")
        }
    }

    fn manager(dir: &TempDir) -> RetentionManager {
        let policy = PolicyHandle::new(RetentionPolicy::default());
        let store = Arc::new(MessageStore::open(dir.path()));
        let media = Arc::new(MediaStore::new(
            dir.path().join("media"),
            Arc::new(NoFetch),
            Duration::from_millis(1),
        ));
        let edits = Arc::new(EditCorrelator::open(
            dir.path(),
            Arc::clone(&store),
            policy.clone(),
            10,
        ));
        let settings = Arc::new(SettingStore::open(&dir.path().join("settings")));
        RetentionManager::new(store, media, edits, settings, policy)
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_claimed_sweep() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let guard = manager.try_begin().expect("flag is free");
        let started = Instant::now();
        let release = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        };
        let ((), stopped) = tokio::join!(release, manager.shutdown(Duration::from_secs(1)));

        assert!(stopped);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_no_sweep_starts_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        assert!(manager.shutdown(Duration::from_millis(100)).await);
        assert!(manager.try_begin().is_none());
        assert!(!manager.is_running());
        assert!(manager.sweep().await.is_none());
        assert!(!manager.is_running());
    }

    #[test]
    fn test_default_policy() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.ttl(ChatClass::Status), chrono::Duration::hours(24));
        assert_eq!(policy.ttl(ChatClass::Channel), chrono::Duration::hours(24));
        assert_eq!(policy.ttl(ChatClass::Group), chrono::Duration::hours(72));
        assert_eq!(policy.ttl(ChatClass::Private), chrono::Duration::hours(72));
    }

    #[test]
    fn test_policy_handle_update() {
        let handle = PolicyHandle::new(RetentionPolicy::default());
        let clone = handle.clone();
        clone.update(RetentionPolicy {
            group_ttl_hours: 1,
            ..Default::default()
        });
        assert_eq!(handle.current().group_ttl_hours, 1);
    }

    #[test]
    fn test_policy_deserializes_partial() {
        let policy: RetentionPolicy = serde_json::from_str(r#"{"group_ttl_hours": 12}"#).unwrap();
        assert_eq!(policy.group_ttl_hours, 12);
        assert_eq!(policy.private_ttl_hours, 72);
    }
}
