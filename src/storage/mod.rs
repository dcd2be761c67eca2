//! Storage abstraction for qsnap.
//!
//! - [`FileStore`]: one file per record in a data directory (default)
//! - [`RedbStore`]: a single redb table, one transaction per write
//! - [`MemoryStore`]: in-process map for tests and embedding hosts
//!
//! Only the snapshot store and the settings handle talk to a backend.
//! Records are opaque bytes here; encoding is the caller's business.

pub mod local;
pub mod memory;
pub mod redb_store;

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

pub use local::FileStore;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;

/// Record key holding the serialized settings.
pub const SETTINGS_KEY: &str = "settings";
/// Record key holding the serialized snapshot collection.
pub const SNAPSHOTS_KEY: &str = "snapshots";

/// Durable key/value storage for whole records.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Human-readable backend name (e.g., "file", "redb").
    fn backend_name(&self) -> &str;

    /// Load a record. Returns None if nothing was ever saved under `key`.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a record. A reader never observes a partially written value.
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Default data directory: `<data_dir>/qsnap`.
pub fn default_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .context("Failed to get data directory")?
        .join("qsnap");
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
    Ok(data_dir)
}
