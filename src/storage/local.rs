//! File backend: each record lives in `<dir>/<key>.<ext>`.
//!
//! Writes land in a sibling temp file first and are renamed over the
//! target, so a crash mid-write leaves the previous record intact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{KeyValueStore, SETTINGS_KEY};

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// File store in the default data directory.
    pub fn open_default() -> Result<Self> {
        Self::new(super::default_data_dir()?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        // Settings stay hand-editable as TOML; everything else is JSON.
        let ext = if key == SETTINGS_KEY { "toml" } else { "json" };
        self.dir.join(format!("{key}.{ext}"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn backend_name(&self) -> &str {
        "file"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.record_path(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
