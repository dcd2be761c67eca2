//! Live mirror from the player queue into one designated snapshot.
//!
//! A queue change is written into the snapshot only if it differs from the
//! baseline, the last queue this coordinator accepted. Code that replaces
//! the queue on purpose (a restore) brackets the replacement with
//! [`QueueSync::suspend`] / [`QueueSync::resume`]: notifications in between
//! are dropped and `resume` adopts the new queue as the baseline, so the
//! replacement is never written back.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::events::{EventKind, EventSource, QueueEvent, Subscription};
use crate::notify::{Notifier, Severity};
use crate::queue::{queues_equal, QueueReader};
use crate::settings::{Settings, SettingsHandle};
use crate::store::SnapshotStore;

/// What a queue-changed notification led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Inactive, suspended, or no snapshot designated
    Ignored,
    Unchanged,
    /// Empty queues are never mirrored
    SkippedEmpty,
    Mirrored,
    /// The designated snapshot is gone; sync switched itself off
    Deactivated,
    Failed,
}

#[derive(Default)]
struct SyncState {
    active: bool,
    suspended: bool,
    baseline: Vec<String>,
    /// Set when a suspension was lifted without re-reading the queue; the
    /// next handler adopts the live queue instead of mirroring it.
    baseline_stale: bool,
    /// Bumped by every suspend, so a late release from an abandoned
    /// bracket cannot lift a newer suspension.
    suspend_epoch: u64,
}

impl SyncState {
    fn reset(&mut self) {
        *self = Self {
            suspend_epoch: self.suspend_epoch,
            ..Self::default()
        };
    }
}

struct SyncInner {
    settings: SettingsHandle,
    store: Arc<SnapshotStore>,
    queue: Arc<dyn QueueReader>,
    notifier: Arc<dyn Notifier>,
    /// Held for the whole of every handler, so suspend() waits for a
    /// handler in flight and no handler starts while suspended.
    state: AsyncMutex<SyncState>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// The event source refused the last start. Already reported, so
    /// apply_sync does not retry until sync is stopped.
    start_failed: AtomicBool,
}

pub struct QueueSync {
    inner: Arc<SyncInner>,
    events: Arc<dyn EventSource>,
}

impl QueueSync {
    pub fn new(
        settings: SettingsHandle,
        store: Arc<SnapshotStore>,
        queue: Arc<dyn QueueReader>,
        events: Arc<dyn EventSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                settings,
                store,
                queue,
                notifier,
                state: AsyncMutex::new(SyncState::default()),
                subscriptions: Mutex::new(Vec::new()),
                start_failed: AtomicBool::new(false),
            }),
            events,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.state.lock().await.active
    }

    pub async fn is_suspended(&self) -> bool {
        self.inner.state.lock().await.suspended
    }

    pub async fn baseline(&self) -> Vec<String> {
        self.inner.state.lock().await.baseline.clone()
    }

    /// Activate iff a snapshot is designated and sync is inactive;
    /// deactivate iff none is designated and sync is active.
    pub async fn apply_sync(&self, settings: &Settings) {
        let should_be_active = settings.synced_snapshot_id.is_some();
        let active = self.is_active().await;
        if should_be_active && !active {
            if !self.inner.start_failed.load(Ordering::SeqCst) {
                self.start().await;
            }
        } else if !should_be_active {
            if active || self.inner.has_subscriptions() {
                self.stop().await;
            }
            self.inner.start_failed.store(false, Ordering::SeqCst);
        }
    }

    pub async fn start(&self) {
        self.stop().await;
        let Some(id) = self.inner.settings.get().synced_snapshot_id else {
            return;
        };

        let on_queue = {
            let inner = self.inner.clone();
            Subscription::spawn(self.events.as_ref(), EventKind::QueueChanged, move |_| {
                let inner = inner.clone();
                async move {
                    inner.handle_queue_changed().await;
                }
            })
        };
        let on_progress = {
            let inner = self.inner.clone();
            Subscription::spawn(self.events.as_ref(), EventKind::PlaybackProgress, move |event| {
                let inner = inner.clone();
                async move {
                    if let QueueEvent::PlaybackProgress(ms) = event {
                        inner.handle_progress(ms).await;
                    }
                }
            })
        };
        let subs = match (on_queue, on_progress) {
            (Ok(q), Ok(p)) => vec![q, p],
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to start queue sync manager: {}", e);
                self.inner
                    .notifier
                    .notify("Failed to start queue sync", Severity::Error);
                self.inner.start_failed.store(true, Ordering::SeqCst);
                return;
            }
        };

        let baseline = match self.inner.queue.read_queue().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Queue sync could not read initial queue: {:#}", e);
                Vec::new()
            }
        };
        {
            let mut state = self.inner.state.lock().await;
            state.active = true;
            state.suspended = false;
            state.baseline = baseline;
        }
        self.inner.replace_subscriptions(subs);
        tracing::info!(snapshot_id = %id, "Queue sync active");
    }

    pub async fn stop(&self) {
        self.inner.replace_subscriptions(Vec::new());
        self.inner.start_failed.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        if state.active {
            tracing::info!("Queue sync stopped");
        }
        state.reset();
    }

    /// Ignore queue changes until [`resume`](Self::resume). Waits for a
    /// handler already running to finish.
    pub async fn suspend(&self) {
        self.inner.suspend().await;
    }

    /// Adopt the current queue as the baseline, then accept changes again.
    pub async fn resume(&self) {
        self.inner.resume(None).await;
    }

    /// Run `f` with sync suspended.
    ///
    /// Sync is resumed however the bracket ends: normally, by error, by
    /// panic, or because the returned future was dropped before finishing.
    pub async fn with_suspended<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let epoch = self.inner.suspend().await;
        let guard = ResumeGuard {
            inner: Some(self.inner.clone()),
            epoch,
        };
        let out = f().await;
        guard.release().await;
        out
    }

    /// Process one queue-changed notification now.
    pub async fn handle_queue_changed(&self) -> SyncOutcome {
        self.inner.handle_queue_changed().await
    }

    pub async fn handle_progress(&self, progress_ms: u64) {
        self.inner.handle_progress(progress_ms).await
    }
}

/// Lifts one suspension when dropped, unless already released.
struct ResumeGuard {
    inner: Option<Arc<SyncInner>>,
    epoch: u64,
}

impl ResumeGuard {
    async fn release(mut self) {
        if let Some(inner) = &self.inner {
            inner.resume(Some(self.epoch)).await;
        }
        self.inner = None;
    }
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let epoch = self.epoch;
        tracing::warn!("Suspended sync bracket ended early, resuming");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    inner.resume(Some(epoch)).await;
                });
            }
            Err(_) => {
                // No runtime to re-read the queue on: lift the suspension
                // now and let the next handler re-capture the baseline.
                if let Ok(mut state) = inner.state.try_lock() {
                    if state.suspended && state.suspend_epoch == epoch {
                        state.suspended = false;
                        state.baseline_stale = true;
                    }
                }
            }
        }
    }
}

impl Drop for QueueSync {
    fn drop(&mut self) {
        self.inner.replace_subscriptions(Vec::new());
    }
}

impl SyncInner {
    fn has_subscriptions(&self) -> bool {
        self.subscriptions
            .lock()
            .map(|subs| !subs.is_empty())
            .unwrap_or(false)
    }

    fn replace_subscriptions(&self, next: Vec<Subscription>) {
        let old = match self.subscriptions.lock() {
            Ok(mut subs) => std::mem::replace(&mut *subs, next),
            Err(e) => std::mem::replace(&mut *e.into_inner(), next),
        };
        for mut sub in old {
            sub.unsubscribe();
        }
    }

    async fn suspend(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.suspended = true;
        state.suspend_epoch += 1;
        tracing::debug!("Sync manager suspended");
        state.suspend_epoch
    }

    /// With `Some(epoch)`, only lifts the suspension taken at that epoch.
    async fn resume(&self, epoch: Option<u64>) {
        let mut state = self.state.lock().await;
        if epoch.is_some_and(|e| !state.suspended || e != state.suspend_epoch) {
            return;
        }
        if state.active {
            match self.queue.read_queue().await {
                Ok(items) => {
                    state.baseline = items;
                    state.baseline_stale = false;
                }
                Err(e) => tracing::warn!("Could not re-read queue on resume: {:#}", e),
            }
        }
        state.suspended = false;
        tracing::debug!("Sync manager resumed");
    }

    async fn handle_queue_changed(&self) -> SyncOutcome {
        let mut state = self.state.lock().await;
        if !state.active || state.suspended {
            return SyncOutcome::Ignored;
        }
        let Some(id) = self.settings.get().synced_snapshot_id else {
            return SyncOutcome::Ignored;
        };

        let current = match self.queue.read_queue().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("Queue sync error: {:#}", e);
                return SyncOutcome::Failed;
            }
        };
        if state.baseline_stale {
            state.baseline = current;
            state.baseline_stale = false;
            return SyncOutcome::Unchanged;
        }
        if queues_equal(&current, &state.baseline) {
            return SyncOutcome::Unchanged;
        }
        if current.is_empty() {
            tracing::debug!("Skipping sync of empty queue to snapshot");
            return SyncOutcome::SkippedEmpty;
        }

        let position = self.queue.progress_ms().await.ok().flatten();
        let items = current.clone();
        match self
            .store
            .update(&id, move |snap| {
                snap.items = items;
                snap.playback_position = position;
            })
            .await
        {
            Ok(Some(_)) => {
                tracing::debug!(snapshot_id = %id, items = current.len(), "Queue mirrored");
                state.baseline = current;
                SyncOutcome::Mirrored
            }
            Ok(None) => {
                self.deactivate_stale(&mut state, &id).await;
                SyncOutcome::Deactivated
            }
            Err(e) => {
                tracing::error!("Queue sync write failed: {:#}", e);
                self.notifier
                    .notify("Failed to sync queue to snapshot", Severity::Warning);
                SyncOutcome::Failed
            }
        }
    }

    async fn handle_progress(&self, progress_ms: u64) {
        let state = self.state.lock().await;
        if !state.active {
            return;
        }
        let Some(id) = self.settings.get().synced_snapshot_id else {
            return;
        };
        // A missing snapshot is detected by the next queue change.
        if let Err(e) = self
            .store
            .update(&id, |snap| snap.playback_position = Some(progress_ms))
            .await
        {
            tracing::debug!("Could not store playback position: {:#}", e);
        }
    }

    async fn deactivate_stale(&self, state: &mut SyncState, id: &str) {
        tracing::warn!(
            snapshot_id = %id,
            "Synced snapshot no longer exists, deactivating sync mode"
        );
        state.reset();
        self.replace_subscriptions(Vec::new());

        let stale = id.to_string();
        if let Err(e) = self
            .settings
            .update(move |s| {
                if s.synced_snapshot_id.as_deref() == Some(stale.as_str()) {
                    s.synced_snapshot_id = None;
                }
            })
            .await
        {
            tracing::error!("Failed to persist sync deactivation: {:#}", e);
        }
        self.notifier.notify(
            "Synced snapshot not found, sync mode was turned off",
            Severity::Warning,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::BroadcastEvents;
    use crate::notify::RecordingNotifier;
    use crate::snapshot::SnapshotType;
    use crate::storage::MemoryStore;
    use crate::testing::{items, settle, snap, FakeQueue};
    use crate::queue::QueueWriter;

    struct Harness {
        backend: Arc<MemoryStore>,
        store: Arc<SnapshotStore>,
        queue: Arc<FakeQueue>,
        events: Arc<BroadcastEvents>,
        notifier: Arc<RecordingNotifier>,
        settings: SettingsHandle,
        sync: QueueSync,
    }

    async fn harness(initial_queue: &[&str]) -> Harness {
        let backend = Arc::new(MemoryStore::new());
        let store = Arc::new(SnapshotStore::new(backend.clone()));
        store
            .add(snap("jam", SnapshotType::Synced, 1, &["s1", "s2"]), 15)
            .await
            .unwrap();
        let events = Arc::new(BroadcastEvents::new());
        let queue = Arc::new(FakeQueue::with_events(events.clone()));
        queue.set_silently(initial_queue);
        let notifier = Arc::new(RecordingNotifier::new());
        let settings = SettingsHandle::new(Settings {
            synced_snapshot_id: Some("jam".to_string()),
            ..Settings::default()
        });
        let sync = QueueSync::new(
            settings.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            notifier.clone(),
        );
        Harness {
            backend,
            store,
            queue,
            events,
            notifier,
            settings,
            sync,
        }
    }

    async fn jam_items(h: &Harness) -> Vec<String> {
        h.store.find("jam").await.unwrap().items
    }

    #[tokio::test]
    async fn test_start_captures_baseline() {
        let h = harness(&["a", "b"]).await;
        h.sync.start().await;

        assert!(h.sync.is_active().await);
        assert!(!h.sync.is_suspended().await);
        assert_eq!(h.sync.baseline().await, items(&["a", "b"]));
        assert_eq!(h.events.receiver_count(), 2);
    }

    #[tokio::test]
    async fn test_apply_sync_is_idempotent() {
        let h = harness(&["a"]).await;
        let s = h.settings.get();

        h.sync.apply_sync(&s).await;
        h.sync.apply_sync(&s).await;
        assert_eq!(h.events.receiver_count(), 2);

        h.sync.apply_sync(&Settings::default()).await;
        settle().await;
        assert!(!h.sync.is_active().await);
        assert_eq!(h.events.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_change_is_mirrored() {
        let h = harness(&["a"]).await;
        h.sync.start().await;
        h.queue.set_progress(1234);

        h.queue.set(&["a", "b"]);
        settle().await;

        let jam = h.store.find("jam").await.unwrap();
        assert_eq!(jam.items, items(&["a", "b"]));
        assert_eq!(jam.playback_position, Some(1234));
        assert_eq!(h.sync.baseline().await, items(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_unchanged_queue_is_not_written() {
        let h = harness(&["a"]).await;
        h.sync.start().await;
        let writes = h.backend.write_count();

        assert_eq!(h.sync.handle_queue_changed().await, SyncOutcome::Unchanged);
        assert_eq!(h.backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_empty_queue_is_never_mirrored() {
        let h = harness(&["a"]).await;
        h.sync.start().await;

        h.queue.set_silently(&[]);
        assert_eq!(h.sync.handle_queue_changed().await, SyncOutcome::SkippedEmpty);
        assert_eq!(jam_items(&h).await, items(&["s1", "s2"]));
        assert_eq!(h.sync.baseline().await, items(&["a"]));
    }

    #[tokio::test]
    async fn test_suspend_resume_law() {
        let h = harness(&["a"]).await;
        h.sync.start().await;

        h.sync.suspend().await;
        h.queue.clear_queue().await.unwrap();
        h.queue.play("r1").await.unwrap();
        h.queue.enqueue(&items(&["r2", "r3"])).await.unwrap();
        settle().await;
        assert_eq!(h.sync.handle_queue_changed().await, SyncOutcome::Ignored);
        h.sync.resume().await;
        settle().await;

        assert_eq!(jam_items(&h).await, items(&["s1", "s2"]));
        assert_eq!(h.sync.baseline().await, items(&["r1", "r2", "r3"]));
        assert!(!h.sync.is_suspended().await);
    }

    #[tokio::test]
    async fn test_with_suspended_resumes_on_error() {
        let h = harness(&["a"]).await;
        h.sync.start().await;

        let queue = h.queue.clone();
        let result: anyhow::Result<()> = h
            .sync
            .with_suspended(move || async move {
                queue.set_silently(&["x"]);
                anyhow::bail!("replacement failed halfway")
            })
            .await;

        assert!(result.is_err());
        assert!(!h.sync.is_suspended().await);
        assert_eq!(h.sync.baseline().await, items(&["x"]));
        assert_eq!(jam_items(&h).await, items(&["s1", "s2"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_bracket_still_resumes() {
        let h = harness(&["s1"]).await;
        h.sync.start().await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            h.sync
                .with_suspended(|| tokio::time::sleep(Duration::from_secs(5))),
        )
        .await;
        assert!(cancelled.is_err());
        settle().await;

        assert!(!h.sync.is_suspended().await);
        h.queue.set(&["user", "change"]);
        settle().await;
        assert_eq!(jam_items(&h).await, items(&["user", "change"]));
    }

    #[tokio::test]
    async fn test_panicking_bracket_still_resumes() {
        let h = harness(&["a"]).await;
        let sync = Arc::new(QueueSync::new(
            h.settings.clone(),
            h.store.clone(),
            h.queue.clone(),
            h.events.clone(),
            h.notifier.clone(),
        ));
        sync.start().await;

        let task = {
            let sync = sync.clone();
            tokio::spawn(async move {
                sync.with_suspended(|| async { panic!("player writer blew up") })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        settle().await;

        assert!(!sync.is_suspended().await);
        h.queue.set_silently(&["a", "b"]);
        assert_eq!(sync.handle_queue_changed().await, SyncOutcome::Mirrored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_release_does_not_lift_newer_suspension() {
        let h = harness(&["a"]).await;
        h.sync.start().await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            h.sync
                .with_suspended(|| tokio::time::sleep(Duration::from_secs(5))),
        )
        .await;
        assert!(cancelled.is_err());
        // A new suspension taken before the abandoned one is released
        h.sync.suspend().await;
        settle().await;

        assert!(h.sync.is_suspended().await);
        h.sync.resume().await;
        assert!(!h.sync.is_suspended().await);
    }

    #[tokio::test]
    async fn test_progress_updates_position_only() {
        let h = harness(&["a"]).await;
        h.sync.start().await;

        h.events.progress(4200);
        settle().await;

        let jam = h.store.find("jam").await.unwrap();
        assert_eq!(jam.playback_position, Some(4200));
        assert_eq!(jam.items, items(&["s1", "s2"]));
    }

    #[tokio::test]
    async fn test_stale_snapshot_deactivates_sync() {
        let h = harness(&["a"]).await;
        h.sync.start().await;
        h.store.delete("jam").await.unwrap();

        h.queue.set_silently(&["a", "b"]);
        assert_eq!(h.sync.handle_queue_changed().await, SyncOutcome::Deactivated);
        settle().await;

        assert!(!h.sync.is_active().await);
        assert!(h.settings.get().synced_snapshot_id.is_none());
        assert_eq!(h.notifier.count(Severity::Warning), 1);
        assert_eq!(h.events.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_and_keeps_baseline() {
        let h = harness(&["a"]).await;
        h.sync.start().await;
        h.backend.set_fail_writes(true);

        h.queue.set_silently(&["a", "b"]);
        assert_eq!(h.sync.handle_queue_changed().await, SyncOutcome::Failed);
        assert_eq!(h.sync.baseline().await, items(&["a"]));
        assert_eq!(h.notifier.count(Severity::Warning), 1);
        assert!(h.sync.is_active().await);
    }

    #[tokio::test]
    async fn test_missing_event_source_stays_inactive() {
        let h = harness(&["a"]).await;
        h.events.set_available(false);

        h.sync.start().await;

        assert!(!h.sync.is_active().await);
        assert_eq!(h.notifier.count(Severity::Error), 1);
    }

    #[tokio::test]
    async fn test_missing_event_source_is_reported_once() {
        let h = harness(&["a"]).await;
        h.events.set_available(false);
        let s = h.settings.get();

        h.sync.apply_sync(&s).await;
        h.sync.apply_sync(&s).await;
        h.sync.apply_sync(&s).await;
        assert!(!h.sync.is_active().await);
        assert_eq!(h.notifier.count(Severity::Error), 1);

        // Clearing the designation and setting it again retries
        h.events.set_available(true);
        h.sync.apply_sync(&Settings::default()).await;
        h.sync.apply_sync(&s).await;
        assert!(h.sync.is_active().await);
        assert_eq!(h.notifier.count(Severity::Error), 1);
    }

    #[tokio::test]
    async fn test_stop_clears_state() {
        let h = harness(&["a"]).await;
        h.sync.start().await;
        h.sync.suspend().await;

        h.sync.stop().await;
        h.sync.stop().await;

        assert!(!h.sync.is_active().await);
        assert!(!h.sync.is_suspended().await);
        assert!(h.sync.baseline().await.is_empty());
        assert_eq!(h.sync.handle_queue_changed().await, SyncOutcome::Ignored);
    }
}
