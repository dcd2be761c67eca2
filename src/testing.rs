//! Scripted player used by the coordinator tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::events::BroadcastEvents;
use crate::queue::{QueueReader, QueueWriter};
use crate::snapshot::{Snapshot, SnapshotType};

pub fn items(uris: &[&str]) -> Vec<String> {
    uris.iter().map(|s| s.to_string()).collect()
}

pub fn snap(id: &str, kind: SnapshotType, created_at: i64, uris: &[&str]) -> Snapshot {
    Snapshot {
        id: id.to_string(),
        created_at,
        name: None,
        kind,
        items: items(uris),
        playback_position: None,
    }
}

/// Let spawned listener tasks drain their channels.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// In-memory live queue. Writer calls mutate it and, when wired to an
/// event source, announce the change the way a real player would.
#[derive(Default)]
pub struct FakeQueue {
    queue: Mutex<Vec<String>>,
    progress: Mutex<Option<u64>>,
    events: Option<Arc<BroadcastEvents>>,
    fail_reads: AtomicBool,
    fail_play: AtomicBool,
    fail_enqueue: AtomicBool,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Arc<BroadcastEvents>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// Change the queue as if the user did it, announcing the change.
    pub fn set(&self, uris: &[&str]) {
        self.set_silently(uris);
        self.announce();
    }

    /// Change the queue without any notification.
    pub fn set_silently(&self, uris: &[&str]) {
        *self.queue.lock().unwrap() = items(uris);
    }

    /// Replace the queue with `n` distinct items, announcing the change.
    pub fn fill(&self, n: usize) {
        *self.queue.lock().unwrap() = (0..n).map(|i| format!("spotify:track:{i}")).collect();
        self.announce();
    }

    pub fn current(&self) -> Vec<String> {
        self.queue.lock().unwrap().clone()
    }

    pub fn set_progress(&self, ms: u64) {
        *self.progress.lock().unwrap() = Some(ms);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    fn announce(&self) {
        if let Some(events) = &self.events {
            events.queue_changed();
        }
    }
}

#[async_trait]
impl QueueReader for FakeQueue {
    async fn read_queue(&self) -> Result<Vec<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("player queue unavailable");
        }
        Ok(self.current())
    }

    async fn progress_ms(&self) -> Result<Option<u64>> {
        Ok(*self.progress.lock().unwrap())
    }
}

#[async_trait]
impl QueueWriter for FakeQueue {
    async fn clear_queue(&self) -> Result<()> {
        self.queue.lock().unwrap().clear();
        self.announce();
        Ok(())
    }

    async fn play(&self, uri: &str) -> Result<()> {
        if self.fail_play.load(Ordering::SeqCst) {
            bail!("cannot play {uri}");
        }
        *self.queue.lock().unwrap() = vec![uri.to_string()];
        self.announce();
        Ok(())
    }

    async fn enqueue(&self, uris: &[String]) -> Result<()> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            bail!("enqueue rejected");
        }
        self.queue.lock().unwrap().extend(uris.iter().cloned());
        self.announce();
        Ok(())
    }
}
