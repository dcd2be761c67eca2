//! Host-facing entry point.
//!
//! The engine owns one instance of each coordinator, all sharing the same
//! settings, store, player handles and notifier. Every user action a host
//! offers goes through here so that settings changes and snapshot
//! mutations are followed by the coordinator transitions they imply.

use std::sync::Arc;

use crate::auto::AutoCapture;
use crate::capacity::CapacityWatcher;
use crate::error::{EngineError, EngineResult};
use crate::events::EventSource;
use crate::notify::{Notifier, Severity};
use crate::queue::{QueueReader, QueueWriter};
use crate::restore::{append_to_queue, replace_queue, RestoreReport};
use crate::settings::{Settings, SettingsHandle};
use crate::snapshot::{normalize_name, Snapshot, SnapshotType};
use crate::storage::KeyValueStore;
use crate::store::SnapshotStore;
use crate::sync::QueueSync;

/// Collaborators the host provides.
pub struct EngineParts {
    pub backend: Arc<dyn KeyValueStore>,
    pub reader: Arc<dyn QueueReader>,
    pub writer: Arc<dyn QueueWriter>,
    pub events: Arc<dyn EventSource>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Engine {
    settings: SettingsHandle,
    store: Arc<SnapshotStore>,
    reader: Arc<dyn QueueReader>,
    writer: Arc<dyn QueueWriter>,
    notifier: Arc<dyn Notifier>,
    auto: AutoCapture,
    sync: QueueSync,
    capacity: CapacityWatcher,
}

fn warn_settings_changed(old: &Settings, new: &Settings) -> bool {
    old.queue_warn_enabled != new.queue_warn_enabled
        || old.queue_max_size != new.queue_max_size
        || old.queue_warn_threshold != new.queue_warn_threshold
}

impl Engine {
    /// Build an engine whose settings are loaded from, and saved to, the
    /// host's backend.
    pub async fn new(parts: EngineParts) -> Self {
        let settings = SettingsHandle::load(parts.backend.clone()).await;
        let store = Arc::new(SnapshotStore::new(parts.backend));
        let auto = AutoCapture::new(
            settings.clone(),
            store.clone(),
            parts.reader.clone(),
            parts.events.clone(),
            parts.notifier.clone(),
        );
        let sync = QueueSync::new(
            settings.clone(),
            store.clone(),
            parts.reader.clone(),
            parts.events.clone(),
            parts.notifier.clone(),
        );
        let capacity = CapacityWatcher::new(
            settings.clone(),
            parts.reader.clone(),
            parts.events,
            parts.notifier.clone(),
        );
        Self {
            settings,
            store,
            reader: parts.reader,
            writer: parts.writer,
            notifier: parts.notifier,
            auto,
            sync,
            capacity,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn settings_handle(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn auto_capture(&self) -> &AutoCapture {
        &self.auto
    }

    pub fn queue_sync(&self) -> &QueueSync {
        &self.sync
    }

    pub fn capacity_watcher(&self) -> &CapacityWatcher {
        &self.capacity
    }

    /// Seed auto capture from the newest snapshot and bring every
    /// coordinator in line with the current settings.
    pub async fn start(&self) {
        let settings = self.settings.get();
        tracing::info!(
            backend = self.store.backend_name(),
            auto_enabled = settings.auto_enabled,
            mode = settings.auto_mode.as_str(),
            "Starting snapshot engine"
        );
        self.auto.prime_from_existing().await;
        self.auto.apply_mode(&settings);
        self.sync.apply_sync(&settings).await;
        self.capacity.start().await;
    }

    pub async fn shutdown(&self) {
        self.auto.stop();
        self.sync.stop().await;
        self.capacity.stop().await;
        tracing::info!("Snapshot engine stopped");
    }

    /// Publish and persist new settings, then apply them.
    ///
    /// The new value takes effect even if persisting it fails; the error is
    /// still returned so the host can tell the user.
    pub async fn set_settings(&self, settings: Settings) -> EngineResult<Settings> {
        let previous = self.settings.get();
        let persisted = self.settings.set(settings).await;
        let current = self.settings.get();

        self.auto.apply_mode(&current);
        if current.max_autosnapshots != previous.max_autosnapshots {
            match self.store.prune_autos_to_max(current.max_autosnapshots).await {
                Ok(evicted) if evicted > 0 => {
                    tracing::info!(evicted, max = current.max_autosnapshots, "Pruned auto snapshots")
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Failed to prune auto snapshots: {:#}", e),
            }
        }
        self.sync.apply_sync(&current).await;
        if warn_settings_changed(&previous, &current) {
            self.capacity.start().await;
        }

        persisted.map_err(EngineError::persistence)?;
        Ok(current)
    }

    async fn read_live_queue(&self) -> EngineResult<Vec<String>> {
        let items = self
            .reader
            .read_queue()
            .await
            .map_err(|e| EngineError::QueueRead(format!("{e:#}")))?;
        if items.is_empty() {
            self.notifier.notify("Queue is empty", Severity::Info);
            return Err(EngineError::EmptyQueue);
        }
        Ok(items)
    }

    /// Save the live queue as a manual snapshot.
    pub async fn create_manual_snapshot(&self, name: Option<String>) -> EngineResult<Snapshot> {
        let items = self.read_live_queue().await?;
        let mut snapshot = Snapshot::new(SnapshotType::Manual, items);
        snapshot.name = normalize_name(name);

        let max_autos = self.settings.get().max_autosnapshots;
        if let Err(e) = self.store.add(snapshot.clone(), max_autos).await {
            self.notifier.notify("Failed to save snapshot", Severity::Error);
            return Err(EngineError::persistence(e));
        }
        tracing::info!(snapshot_id = %snapshot.id, items = snapshot.items.len(), "Manual snapshot saved");
        self.notifier.notify(
            &format!("Snapshot saved: {}", snapshot.display_name()),
            Severity::Success,
        );
        Ok(snapshot)
    }

    /// Save the live queue as a synced snapshot and start mirroring into it.
    /// A previously designated synced snapshot is kept but no longer
    /// updated.
    pub async fn create_synced_snapshot(&self, name: Option<String>) -> EngineResult<Snapshot> {
        let items = self.read_live_queue().await?;
        let mut snapshot = Snapshot::new(SnapshotType::Synced, items);
        snapshot.name = normalize_name(name);
        snapshot.playback_position = self.reader.progress_ms().await.ok().flatten();

        let max_autos = self.settings.get().max_autosnapshots;
        if let Err(e) = self.store.add(snapshot.clone(), max_autos).await {
            self.notifier
                .notify("Failed to create synced snapshot", Severity::Error);
            return Err(EngineError::persistence(e));
        }

        let id = snapshot.id.clone();
        self.sync.stop().await;
        let persisted = self
            .settings
            .update(move |s| s.synced_snapshot_id = Some(id))
            .await;
        self.sync.apply_sync(&self.settings.get()).await;
        persisted.map_err(EngineError::persistence)?;

        tracing::info!(snapshot_id = %snapshot.id, "Synced snapshot created");
        self.notifier.notify(
            &format!("Syncing queue to {}", snapshot.display_name()),
            Severity::Success,
        );
        Ok(snapshot)
    }

    /// Stop mirroring. The synced snapshot itself is kept.
    pub async fn stop_sync(&self) -> EngineResult<()> {
        let persisted = self
            .settings
            .update(|s| s.synced_snapshot_id = None)
            .await;
        self.sync.apply_sync(&self.settings.get()).await;
        persisted.map_err(EngineError::persistence)?;
        Ok(())
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.store.load().await
    }

    /// Set a label, or reset to the generated name with `None` or blank.
    pub async fn rename_snapshot(&self, id: &str, name: Option<String>) -> EngineResult<Snapshot> {
        self.store
            .rename(id, name)
            .await
            .map_err(EngineError::persistence)?
            .ok_or_else(|| EngineError::SnapshotNotFound(id.to_string()))
    }

    /// Delete a snapshot. Deleting the designated synced snapshot also
    /// ends sync mode.
    pub async fn delete_snapshot(&self, id: &str) -> EngineResult<Snapshot> {
        let removed = self
            .store
            .delete(id)
            .await
            .map_err(EngineError::persistence)?
            .ok_or_else(|| EngineError::SnapshotNotFound(id.to_string()))?;
        if self.settings.get().synced_snapshot_id.as_deref() == Some(id) {
            self.stop_sync().await?;
        }
        tracing::info!(snapshot_id = %id, "Snapshot deleted");
        Ok(removed)
    }

    pub async fn clear_auto_snapshots(&self) -> EngineResult<usize> {
        let removed = self
            .store
            .clear_autos()
            .await
            .map_err(EngineError::persistence)?;
        tracing::info!(removed, "Auto snapshots cleared");
        Ok(removed)
    }

    async fn find(&self, id: &str) -> EngineResult<Snapshot> {
        self.store
            .find(id)
            .await
            .ok_or_else(|| EngineError::SnapshotNotFound(id.to_string()))
    }

    /// Replace the live queue with a snapshot. With `save_current` set and
    /// `prompt_manual_before_replace` enabled, the queue being replaced is
    /// first saved as a manual snapshot.
    pub async fn restore(&self, id: &str, save_current: bool) -> EngineResult<RestoreReport> {
        let snapshot = self.find(id).await?;
        if save_current && self.settings.get().prompt_manual_before_replace {
            match self.create_manual_snapshot(None).await {
                Ok(_) | Err(EngineError::EmptyQueue) => {}
                Err(e) => return Err(e),
            }
        }
        replace_queue(
            self.writer.as_ref(),
            &self.sync,
            self.notifier.as_ref(),
            &snapshot,
        )
        .await
    }

    pub async fn append(&self, id: &str) -> EngineResult<RestoreReport> {
        let snapshot = self.find(id).await?;
        append_to_queue(
            self.reader.as_ref(),
            self.writer.as_ref(),
            &self.sync,
            self.notifier.as_ref(),
            &snapshot,
        )
        .await
    }
}
