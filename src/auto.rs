//! Automatic capture of the live queue.
//!
//! Exactly one liveness source is active at a time: nothing, a periodic
//! timer, or the player's queue-changed notification. Whichever fires runs
//! [`AutoCapture::capture_if_changed`], and runs are serialized through the
//! lock that guards the last observed queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::events::{EventKind, EventSource, PeriodicTimer, Subscription};
use crate::notify::{Notifier, Severity};
use crate::queue::{queues_equal, QueueReader};
use crate::settings::{AutoMode, Settings, SettingsHandle};
use crate::snapshot::{Snapshot, SnapshotType};
use crate::store::SnapshotStore;

/// Effective capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Disabled,
    Timer,
    OnChange,
}

impl CaptureMode {
    pub fn from_settings(settings: &Settings) -> Self {
        match (settings.auto_enabled, settings.auto_mode) {
            (false, _) => Self::Disabled,
            (true, AutoMode::Timer) => Self::Timer,
            (true, AutoMode::OnChange) => Self::OnChange,
        }
    }
}

/// Result of one capture decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured(String),
    Disabled,
    EmptyQueue,
    /// `only_new_items` is set and nothing new was queued
    NoNewItems,
    Unchanged,
    /// Same items as an existing auto snapshot
    Duplicate,
    /// The source that triggered this run was torn down meanwhile
    Stale,
    Failed,
}

enum ActiveSource {
    Idle,
    Timer(PeriodicTimer),
    Watcher(Subscription),
}

struct ModeRuntime {
    mode: CaptureMode,
    interval_ms: Option<u64>,
    source: ActiveSource,
    /// Mode whose source could not be started. It is reported once and not
    /// retried until a different mode is requested.
    failed_mode: Option<CaptureMode>,
}

struct AutoInner {
    settings: SettingsHandle,
    store: Arc<SnapshotStore>,
    queue: Arc<dyn QueueReader>,
    notifier: Arc<dyn Notifier>,
    /// Last queue the decision routine looked at. Holding this lock is
    /// what keeps two runs from overlapping.
    last_observed: AsyncMutex<Vec<String>>,
    /// Bumped on every teardown so runs from a dead source bail out.
    generation: AtomicU64,
}

pub struct AutoCapture {
    inner: Arc<AutoInner>,
    events: Arc<dyn EventSource>,
    runtime: Mutex<ModeRuntime>,
}

impl AutoCapture {
    pub fn new(
        settings: SettingsHandle,
        store: Arc<SnapshotStore>,
        queue: Arc<dyn QueueReader>,
        events: Arc<dyn EventSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(AutoInner {
                settings,
                store,
                queue,
                notifier,
                last_observed: AsyncMutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
            events,
            runtime: Mutex::new(ModeRuntime {
                mode: CaptureMode::Disabled,
                interval_ms: None,
                source: ActiveSource::Idle,
                failed_mode: None,
            }),
        }
    }

    fn runtime(&self) -> std::sync::MutexGuard<'_, ModeRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> CaptureMode {
        self.runtime().mode
    }

    /// Interval of the running timer, if any.
    pub fn active_interval_ms(&self) -> Option<u64> {
        let rt = self.runtime();
        match &rt.source {
            ActiveSource::Timer(_) => rt.interval_ms,
            _ => None,
        }
    }

    pub async fn last_observed(&self) -> Vec<String> {
        self.inner.last_observed.lock().await.clone()
    }

    /// Seed the last observed queue from the newest persisted snapshot so
    /// a queue unchanged since the last session is not captured again.
    pub async fn prime_from_existing(&self) {
        let newest = self.inner.store.load().await.into_iter().next();
        if let Some(snapshot) = newest.filter(|s| !s.items.is_empty()) {
            tracing::debug!(
                snapshot_id = %snapshot.id,
                items = snapshot.items.len(),
                "Primed auto capture from existing snapshot"
            );
            *self.inner.last_observed.lock().await = snapshot.items;
        }
    }

    /// Bring the active source in line with `settings`.
    ///
    /// Idempotent: an unchanged effective mode does nothing, except that a
    /// changed interval in timer mode restarts the timer.
    pub fn apply_mode(&self, settings: &Settings) {
        let desired = CaptureMode::from_settings(settings);
        let mut rt = self.runtime();

        if rt.failed_mode == Some(desired) {
            return;
        }
        rt.failed_mode = None;

        if desired == rt.mode {
            if desired == CaptureMode::Timer && rt.interval_ms != Some(settings.auto_interval_ms) {
                tracing::info!(
                    interval_ms = settings.auto_interval_ms,
                    "Restarting auto capture timer"
                );
                self.teardown(&mut rt);
                self.start_timer(&mut rt, settings.auto_interval_ms);
            }
            return;
        }

        tracing::info!(from = ?rt.mode, to = ?desired, "Switching auto capture mode");
        self.teardown(&mut rt);
        let mode = match desired {
            CaptureMode::Disabled => CaptureMode::Disabled,
            CaptureMode::Timer => {
                self.start_timer(&mut rt, settings.auto_interval_ms);
                CaptureMode::Timer
            }
            CaptureMode::OnChange => {
                if self.start_watcher(&mut rt) {
                    CaptureMode::OnChange
                } else {
                    rt.failed_mode = Some(CaptureMode::OnChange);
                    CaptureMode::Disabled
                }
            }
        };
        rt.mode = mode;
    }

    /// Tear down whatever source is active.
    pub fn stop(&self) {
        let mut rt = self.runtime();
        self.teardown(&mut rt);
        rt.mode = CaptureMode::Disabled;
        rt.failed_mode = None;
    }

    fn teardown(&self, rt: &mut ModeRuntime) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        match std::mem::replace(&mut rt.source, ActiveSource::Idle) {
            ActiveSource::Idle => {}
            ActiveSource::Timer(mut timer) => timer.stop(),
            ActiveSource::Watcher(mut sub) => sub.unsubscribe(),
        }
        rt.interval_ms = None;
    }

    fn start_timer(&self, rt: &mut ModeRuntime, interval_ms: u64) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        let timer = PeriodicTimer::start(Duration::from_millis(interval_ms), move || {
            let inner = inner.clone();
            async move {
                inner.capture(Some(generation)).await;
            }
        });
        rt.source = ActiveSource::Timer(timer);
        rt.interval_ms = Some(interval_ms);
    }

    fn start_watcher(&self, rt: &mut ModeRuntime) -> bool {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        let result = Subscription::spawn(self.events.as_ref(), EventKind::QueueChanged, move |_| {
            let inner = inner.clone();
            async move {
                inner.capture(Some(generation)).await;
            }
        });
        match result {
            Ok(sub) => {
                rt.source = ActiveSource::Watcher(sub);
                true
            }
            Err(e) => {
                tracing::error!("Failed to start queue update watcher: {}", e);
                self.inner
                    .notifier
                    .notify("Failed to start queue update watcher", Severity::Error);
                false
            }
        }
    }

    /// Run the capture decision once, now.
    pub async fn capture_if_changed(&self) -> CaptureOutcome {
        self.inner.capture(None).await
    }
}

impl Drop for AutoCapture {
    fn drop(&mut self) {
        let mut rt = self.runtime();
        self.teardown(&mut rt);
    }
}

impl AutoInner {
    async fn capture(&self, generation: Option<u64>) -> CaptureOutcome {
        let mut last = self.last_observed.lock().await;
        if let Some(expected) = generation {
            if self.generation.load(Ordering::SeqCst) != expected {
                return CaptureOutcome::Stale;
            }
        }

        let settings = self.settings.get();
        if !settings.auto_enabled {
            return CaptureOutcome::Disabled;
        }

        let current = match self.queue.read_queue().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("Auto snapshot failed to read queue: {:#}", e);
                self.notifier
                    .notify("Failed to save automatic snapshot", Severity::Warning);
                return CaptureOutcome::Failed;
            }
        };
        if current.is_empty() {
            tracing::debug!("Queue is empty, skipping auto snapshot");
            return CaptureOutcome::EmptyQueue;
        }

        // From here on the last observed queue always becomes `current`,
        // captured or not, except when persisting fails.
        if settings.only_new_items {
            let seen: HashSet<&str> = last.iter().map(String::as_str).collect();
            if current.iter().all(|uri| seen.contains(uri.as_str())) {
                *last = current;
                return CaptureOutcome::NoNewItems;
            }
        }

        if queues_equal(&current, &last) {
            *last = current;
            return CaptureOutcome::Unchanged;
        }

        let autos = self.store.list_by_type(SnapshotType::Auto).await;
        if autos.iter().any(|s| queues_equal(&s.items, &current)) {
            tracing::debug!("Queue matches an existing auto snapshot, skipping");
            *last = current;
            return CaptureOutcome::Duplicate;
        }

        let snapshot = Snapshot::new(SnapshotType::Auto, current.clone());
        let id = snapshot.id.clone();
        match self.store.add(snapshot, settings.max_autosnapshots).await {
            Ok(()) => {
                tracing::info!(snapshot_id = %id, items = current.len(), "Auto snapshot saved");
                *last = current;
                CaptureOutcome::Captured(id)
            }
            Err(e) => {
                tracing::error!("Auto snapshot error: {:#}", e);
                self.notifier
                    .notify("Failed to save automatic snapshot", Severity::Error);
                CaptureOutcome::Failed
            }
        }
    }
}
