use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::KeyValueStore;

/// In-process record map. Can be told to fail writes, which is how the
/// coordinators' error paths get exercised.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    failing_loads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` loads fail.
    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a record directly, bypassing the failure switch.
    pub fn insert_raw(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(key.to_string(), bytes.into());
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            bail!("simulated read failure for {key}");
        }
        let records = self.records.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        Ok(records.get(key).cloned())
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("simulated write failure for {key}");
        }
        let mut records = self.records.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        records.insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
