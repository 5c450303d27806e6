//! Metadata store behind the adapter's persistent records.
//!
//! Checkpoints, configuration numbers, and vote records go through this
//! seam. Production uses RocksDB; tests use the in-memory store. All
//! operations are synchronous blocking I/O; the touched values are small.

use parking_lot::RwLock;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(String),
}

/// Flat key-value view over the host's metadata store.
pub trait MetadataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), DbError>;
    fn delete(&self, key: &str) -> Result<(), DbError>;
}

/// RocksDB-backed store.
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_keep_log_file_num(10);

        let db = DB::open(&opts, path).map_err(|e| DbError::Database(e.to_string()))?;
        Ok(RocksDbStore { db })
    }
}

impl MetadataStore for RocksDbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| DbError::Database(e.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DbError> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| DbError::Database(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), DbError> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| DbError::Database(e.to_string()))
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DbError> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DbError> {
        self.map.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn MetadataStore) {
        assert_eq!(store.get("missing").unwrap(), None);

        store.put("k", b"v1").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v1".to_vec()));

        store.put("k", b"v2").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v2".to_vec()));

        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn memory_store_basics() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn rocksdb_store_basics() {
        let dir = TempDir::new().unwrap();
        exercise(&RocksDbStore::open(dir.path()).unwrap());
    }

    #[test]
    fn rocksdb_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksDbStore::open(dir.path()).unwrap();
            store.put("persisted", b"value").unwrap();
        }
        let store = RocksDbStore::open(dir.path()).unwrap();
        assert_eq!(store.get("persisted").unwrap(), Some(b"value".to_vec()));
    }
}
