//! Persistent room-state storage.
//!
//! Each room's canonical state persists as one opaque blob keyed by room id,
//! overwritten wholesale on every mutation; no append log, no partial
//! writes. The room core depends only on the [`RoomStorage`] capability;
//! [`SledRoomStore`] is the production backend and [`MemoryRoomStore`] backs
//! tests and ephemeral deployments.

mod sled_store;

pub use sled_store::SledRoomStore;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("storage initialization failed: {0}")]
    InitFailed(String),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Injected persistence capability: get/put of one opaque blob per room.
#[async_trait]
pub trait RoomStorage: Send + Sync {
    async fn get(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>>;
    async fn put(&self, room_id: &str, bytes: &[u8]) -> StorageResult<()>;
}

/// Metadata stored alongside room state blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMetadata {
    /// Unique room identifier
    pub room_id: String,
    /// Human-readable name
    pub name: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last state write
    pub updated_at: i64,
    /// Size of the last persisted state blob in bytes
    pub size_bytes: u64,
}

impl RoomMetadata {
    pub fn new(room_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            room_id: room_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            size_bytes: 0,
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/rooms.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

/// In-memory room storage: a plain map under a mutex.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStorage for MemoryRoomStore {
    async fn get(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(room_id).cloned())
    }

    async fn put(&self, room_id: &str, bytes: &[u8]) -> StorageResult<()> {
        self.blobs.lock().insert(room_id.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_creation() {
        let meta = RoomMetadata::new("room-123", "Lobby");

        assert_eq!(meta.room_id, "room-123");
        assert_eq!(meta.name, "Lobby");
        assert!(meta.created_at > 0);
        assert_eq!(meta.size_bytes, 0);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 500);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryRoomStore::new();

        assert!(store.get("lobby").await.unwrap().is_none());

        store.put("lobby", b"one").await.unwrap();
        store.put("lobby", b"two").await.unwrap();

        assert_eq!(store.get("lobby").await.unwrap().unwrap(), b"two");
    }
}
