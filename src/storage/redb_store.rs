//! redb backend: all records in one table keyed by record name.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::KeyValueStore;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("failed to create redb at {}", path.display()))?;
        // Ensure table exists
        {
            let txn = db.begin_write()?;
            txn.open_table(RECORDS)?;
            txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Default path: `<data_dir>/qsnap/qsnap.redb`
    pub fn default_path() -> Result<PathBuf> {
        Ok(super::default_data_dir()?.join("qsnap.redb"))
    }
}

#[async_trait]
impl KeyValueStore for RedbStore {
    fn backend_name(&self) -> &str {
        "redb"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        Ok(table.get(key)?.map(|data| data.value().to_vec()))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            table.insert(key, bytes)?;
        }
        txn.commit().context("failed to commit redb write")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_redb_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.redb");

        {
            let store = RedbStore::create(&path).unwrap();
            assert!(store.load("snapshots").await.unwrap().is_none());
            store.save("snapshots", b"[]").await.unwrap();
            store.save("settings", b"x = 1").await.unwrap();
        }

        let store = RedbStore::create(&path).unwrap();
        assert_eq!(store.load("snapshots").await.unwrap(), Some(b"[]".to_vec()));
        assert_eq!(store.load("settings").await.unwrap(), Some(b"x = 1".to_vec()));
        assert_eq!(store.backend_name(), "redb");
    }
}
