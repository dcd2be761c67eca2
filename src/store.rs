//! Snapshot store: the only code that reads or writes the persisted
//! snapshot collection.
//!
//! Every mutation is a read-modify-write performed under one async lock,
//! so two coordinators persisting at the same time cannot lose each
//! other's update. Reads never fail: a missing or corrupt collection
//! reads as empty.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::snapshot::{normalize_name, Snapshot, SnapshotType};
use crate::storage::{KeyValueStore, SNAPSHOTS_KEY};

pub struct SnapshotStore {
    backend: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

/// Newest first.
fn sort_descending(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Keep the newest `max_autos` auto records; manual and synced records
/// pass through untouched.
fn retain_autos(snapshots: Vec<Snapshot>, max_autos: usize) -> Vec<Snapshot> {
    let mut snapshots = snapshots;
    sort_descending(&mut snapshots);
    let (autos, others): (Vec<_>, Vec<_>) = snapshots.into_iter().partition(Snapshot::is_auto);
    let evicted = autos.len().saturating_sub(max_autos);
    if evicted > 0 {
        tracing::debug!(evicted, max_autos, "Evicting oldest auto snapshots");
    }
    others
        .into_iter()
        .chain(autos.into_iter().take(max_autos))
        .collect()
}

fn decode(bytes: &[u8]) -> Vec<Snapshot> {
    let values: Vec<serde_json::Value> = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Snapshot collection corrupt, treating as empty: {}", e);
            return Vec::new();
        }
    };
    let total = values.len();
    let snapshots: Vec<Snapshot> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    if snapshots.len() != total {
        tracing::warn!(
            skipped = total - snapshots.len(),
            "Skipped unreadable snapshot records"
        );
    }
    snapshots
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    /// All snapshots, newest first. Never fails.
    pub async fn load(&self) -> Vec<Snapshot> {
        match self.load_for_write().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!("Could not read snapshots: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Read side of a read-modify-write. A corrupt record still reads as
    /// empty, but a failed backend read aborts the write.
    async fn load_for_write(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = match self
            .backend
            .load(SNAPSHOTS_KEY)
            .await
            .context("Failed to read snapshots")?
        {
            Some(bytes) => decode(&bytes),
            None => Vec::new(),
        };
        sort_descending(&mut snapshots);
        Ok(snapshots)
    }

    /// Replace the whole collection.
    pub async fn save(&self, snapshots: Vec<Snapshot>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(snapshots).await
    }

    async fn write(&self, mut snapshots: Vec<Snapshot>) -> Result<()> {
        sort_descending(&mut snapshots);
        let json = serde_json::to_vec(&snapshots).context("Failed to serialize snapshots")?;
        self.backend
            .save(SNAPSHOTS_KEY, &json)
            .await
            .context("Failed to write snapshots")
    }

    /// Read-modify-write of the whole collection under the store lock.
    async fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Snapshot>) -> T,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshots = self.load_for_write().await?;
        let out = f(&mut snapshots);
        self.write(snapshots).await?;
        Ok(out)
    }

    /// Insert a snapshot. Auto snapshots are then trimmed to `max_autos`,
    /// oldest first; other categories are never trimmed.
    pub async fn add(&self, snapshot: Snapshot, max_autos: usize) -> Result<()> {
        let id = snapshot.id.clone();
        let kind = snapshot.kind;
        let _guard = self.write_lock.lock().await;
        let mut snapshots = self.load_for_write().await?;
        snapshots.retain(|s| s.id != snapshot.id);
        snapshots.push(snapshot);
        let snapshots = if kind == SnapshotType::Auto {
            retain_autos(snapshots, max_autos)
        } else {
            snapshots
        };
        self.write(snapshots).await?;
        tracing::debug!(snapshot_id = %id, kind = %kind, "Snapshot added");
        Ok(())
    }

    /// Re-apply the auto retention bound. Returns how many were evicted.
    pub async fn prune_autos_to_max(&self, max_autos: usize) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let snapshots = self.load_for_write().await?;
        let before = snapshots.len();
        let kept = retain_autos(snapshots, max_autos);
        let evicted = before - kept.len();
        if evicted > 0 {
            self.write(kept).await?;
        }
        Ok(evicted)
    }

    /// Drop every auto snapshot. Returns how many were removed.
    pub async fn clear_autos(&self) -> Result<usize> {
        self.modify(|snapshots| {
            let before = snapshots.len();
            snapshots.retain(|s| !s.is_auto());
            before - snapshots.len()
        })
        .await
    }

    pub async fn find(&self, id: &str) -> Option<Snapshot> {
        self.load().await.into_iter().find(|s| s.id == id)
    }

    /// The designated synced snapshot, if it still exists.
    pub async fn find_synced(&self, id: &str) -> Option<Snapshot> {
        self.find(id).await
    }

    pub async fn list_by_type(&self, kind: SnapshotType) -> Vec<Snapshot> {
        self.load()
            .await
            .into_iter()
            .filter(|s| s.kind == kind)
            .collect()
    }

    /// Mutate one snapshot in place. Returns the updated record, or None
    /// (and writes nothing) if `id` does not exist.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<Snapshot>>
    where
        F: FnOnce(&mut Snapshot),
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshots = self.load_for_write().await?;
        let Some(snap) = snapshots.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        f(snap);
        let updated = snap.clone();
        self.write(snapshots).await?;
        Ok(Some(updated))
    }

    /// Set or clear (None / blank) the user label.
    pub async fn rename(&self, id: &str, name: Option<String>) -> Result<Option<Snapshot>> {
        let name = normalize_name(name);
        self.update(id, move |s| s.name = name).await
    }

    /// Remove one snapshot. Returns the removed record.
    pub async fn delete(&self, id: &str) -> Result<Option<Snapshot>> {
        let _guard = self.write_lock.lock().await;
        let mut snapshots = self.load_for_write().await?;
        let Some(pos) = snapshots.iter().position(|s| s.id == id) else {
            return Ok(None);
        };
        let removed = snapshots.remove(pos);
        self.write(snapshots).await?;
        Ok(Some(removed))
    }
}
