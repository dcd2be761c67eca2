//! Putting a snapshot back into the player.
//!
//! Both operations run with queue sync suspended, so the player's own
//! change notifications for the replacement are never mirrored into the
//! synced snapshot.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::notify::{Notifier, Severity};
use crate::queue::{QueueReader, QueueWriter};
use crate::snapshot::Snapshot;
use crate::sync::QueueSync;

/// Most items handed to the player in one enqueue call.
pub const ENQUEUE_CHUNK: usize = 100;

/// Pause between starting the first item and queueing the rest, giving the
/// player time to switch tracks.
pub const PLAYER_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    /// Items the operation tried to put in the queue
    pub requested: usize,
    /// Items the player accepted
    pub queued: usize,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.queued == self.requested
    }
}

async fn enqueue_chunks(writer: &dyn QueueWriter, items: &[String]) -> usize {
    let mut added = 0;
    for chunk in items.chunks(ENQUEUE_CHUNK) {
        match writer.enqueue(chunk).await {
            Ok(()) => added += chunk.len(),
            Err(e) => tracing::warn!(size = chunk.len(), "Enqueue chunk failed: {:#}", e),
        }
    }
    added
}

/// Replace the live queue with the snapshot: clear, play the first item,
/// then queue the rest in order.
pub async fn replace_queue(
    writer: &dyn QueueWriter,
    sync: &QueueSync,
    notifier: &dyn Notifier,
    snapshot: &Snapshot,
) -> EngineResult<RestoreReport> {
    let Some((first, rest)) = snapshot.items.split_first() else {
        notifier.notify("Snapshot is empty", Severity::Info);
        return Err(EngineError::EmptySnapshot(snapshot.id.clone()));
    };

    sync.with_suspended(move || async move {
        if let Err(e) = writer.clear_queue().await {
            tracing::warn!("Clearing the queue failed (continuing): {:#}", e);
        }

        if let Err(e) = writer.play(first).await {
            tracing::warn!(uri = %first, "Failed to start first item: {:#}", e);
            notifier.notify("Failed to start snapshot", Severity::Error);
            return Err(EngineError::Player(format!("{e:#}")));
        }

        tokio::time::sleep(PLAYER_SETTLE).await;
        let added = enqueue_chunks(writer, rest).await;

        let report = RestoreReport {
            requested: snapshot.items.len(),
            queued: added + 1,
        };
        tracing::info!(
            snapshot_id = %snapshot.id,
            requested = report.requested,
            queued = report.queued,
            "Queue replaced"
        );
        if report.is_complete() {
            notifier.notify(
                &format!("Queue replaced ({} items)", report.requested),
                Severity::Success,
            );
        } else {
            notifier.notify(
                &format!(
                    "Replaced; some items couldn't be queued ({}/{})",
                    report.queued, report.requested
                ),
                Severity::Warning,
            );
        }
        Ok(report)
    })
    .await
}

/// Queue the snapshot's items behind the live queue. Items already in the
/// live queue are skipped.
pub async fn append_to_queue(
    reader: &dyn QueueReader,
    writer: &dyn QueueWriter,
    sync: &QueueSync,
    notifier: &dyn Notifier,
    snapshot: &Snapshot,
) -> EngineResult<RestoreReport> {
    if snapshot.items.is_empty() {
        notifier.notify("Snapshot is empty", Severity::Info);
        return Err(EngineError::EmptySnapshot(snapshot.id.clone()));
    }

    let live = reader
        .read_queue()
        .await
        .map_err(|e| EngineError::QueueRead(format!("{e:#}")))?;
    let present: HashSet<&str> = live.iter().map(String::as_str).collect();
    let missing: Vec<String> = snapshot
        .items
        .iter()
        .filter(|uri| !present.contains(uri.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        notifier.notify("All items are already in the queue", Severity::Info);
        return Ok(RestoreReport {
            requested: 0,
            queued: 0,
        });
    }

    let missing = &missing;
    let report = sync
        .with_suspended(move || async move {
            let added = enqueue_chunks(writer, missing).await;
            RestoreReport {
                requested: missing.len(),
                queued: added,
            }
        })
        .await;

    let skipped = snapshot.items.len() - missing.len();
    tracing::info!(
        snapshot_id = %snapshot.id,
        queued = report.queued,
        skipped,
        "Snapshot appended"
    );
    if report.queued == 0 {
        notifier.notify("Failed to append snapshot to queue", Severity::Error);
        return Err(EngineError::Player("no items were accepted".to_string()));
    }
    let message = if skipped > 0 {
        format!(
            "Added {} items to the queue ({} already queued)",
            report.queued, skipped
        )
    } else {
        format!("Added {} items to the queue", report.queued)
    };
    let severity = if report.is_complete() {
        Severity::Success
    } else {
        Severity::Warning
    };
    notifier.notify(&message, severity);
    Ok(report)
}
