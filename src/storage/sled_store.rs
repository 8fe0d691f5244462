//! Sled-backed room storage.
//!
//! Room state blobs live in one tree keyed by room id; room metadata lives
//! in a second tree, bincode-encoded. A state write overwrites the previous
//! blob wholesale and touches the metadata record when one exists.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sled::{Db, Tree};

use super::{RoomMetadata, RoomStorage, StorageConfig, StorageError, StorageResult};

const TREE_STATES: &str = "room_states";
const TREE_METADATA: &str = "room_meta";

/// Sled-based store for room state and metadata
#[derive(Clone)]
pub struct SledRoomStore {
    db: Arc<Db>,
    states: Tree,
    metadata: Tree,
}

impl SledRoomStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let states = db.open_tree(TREE_STATES)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            states,
            metadata,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    pub fn room_exists(&self, room_id: &str) -> StorageResult<bool> {
        Ok(self.states.contains_key(room_id.as_bytes())?)
    }

    /// Save room metadata
    pub fn save_metadata(&self, meta: &RoomMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.room_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load room metadata
    pub fn get_metadata(&self, room_id: &str) -> StorageResult<Option<RoomMetadata>> {
        match self.metadata.get(room_id.as_bytes())? {
            Some(bytes) => {
                let meta: RoomMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List all rooms with metadata
    pub fn list_rooms(&self) -> StorageResult<Vec<RoomMetadata>> {
        let mut rooms = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            let meta: RoomMetadata = bincode::deserialize(&value)?;
            rooms.push(meta);
        }
        Ok(rooms)
    }

    /// Delete a room's state and metadata
    pub fn delete_room(&self, room_id: &str) -> StorageResult<()> {
        self.states.remove(room_id.as_bytes())?;
        self.metadata.remove(room_id.as_bytes())?;
        Ok(())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl RoomStorage for SledRoomStore {
    async fn get(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.states.get(room_id.as_bytes())? {
            Some(bytes) => Ok(Some(bytes.to_vec())),
            None => Ok(None),
        }
    }

    async fn put(&self, room_id: &str, bytes: &[u8]) -> StorageResult<()> {
        self.states.insert(room_id.as_bytes(), bytes)?;

        if let Some(mut meta) = self.get_metadata(room_id)? {
            meta.updated_at = chrono::Utc::now().timestamp();
            meta.size_bytes = bytes.len() as u64;
            self.save_metadata(&meta)?;
        }

        Ok(())
    }
}

impl Drop for SledRoomStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
