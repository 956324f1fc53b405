//! Durable snapshot storage for room documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  snapshot (debounced)  ┌────────────────┐  blocking pool  ┌───────────────┐
//! │ Room actor  │ ─────────────────────► │ SnapshotWriter │ ──────────────► │ SnapshotStore │
//! │ (in-memory) │                        │ (retry/backoff)│                 │ RocksDB / mem │
//! └──────┬──────┘                        └────────────────┘                 └───────┬───────┘
//!        │                 on activation: load_with_retry                          │
//!        └◄────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stores are keyed by room name and hold one full snapshot per room. Store
//! calls are synchronous and run on tokio's blocking pool.

pub mod rocks;
pub mod writer;

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};
pub use writer::{
    load_with_retry, PersistCounters, PersistStats, RetryPolicy, SnapshotWriter, WriterLease,
};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable blob store keyed by room name.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest snapshot for `room`, if one was ever saved.
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the snapshot for `room`.
    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// In-process store, used when no storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(snapshots.get(room).cloned())
    }

    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        snapshots.insert(room.to_string(), snapshot.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load("r").unwrap().is_none());

        store.save("r", &[1, 2, 3]).unwrap();
        store.save("other", &[9]).unwrap();
        assert_eq!(store.load("r").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.len(), 2);

        store.save("r", &[4]).unwrap();
        assert_eq!(store.load("r").unwrap(), Some(vec![4]));
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::Database("disk full".into()).to_string(),
            "database error: disk full"
        );
        assert_eq!(
            StoreError::Task("cancelled".into()).to_string(),
            "storage task failed: cancelled"
        );
    }
}
