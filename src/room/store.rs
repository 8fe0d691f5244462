//! Canonical store: lazy-loaded, write-through persisted room state.
//!
//! Each room owns exactly one `CanonicalStore`. The persisted blob is
//! fetched at most once per in-memory activation; after that every applied
//! delta replaces the in-memory state and writes the whole blob back in the
//! same call.

use std::sync::Arc;

use tracing::warn;

use super::state::{CanonicalState, StateDelta};
use super::RoomResult;
use crate::storage::RoomStorage;

pub struct CanonicalStore {
    room_id: String,
    state: CanonicalState,
    loaded: bool,
    storage: Arc<dyn RoomStorage>,
}

impl CanonicalStore {
    pub fn new(room_id: impl Into<String>, storage: Arc<dyn RoomStorage>) -> Self {
        Self {
            room_id: room_id.into(),
            state: CanonicalState::default(),
            loaded: false,
            storage,
        }
    }

    /// Fetch the last persisted state, once per activation. Subsequent calls
    /// are no-ops. A missing blob yields the zero-value state; a blob that
    /// fails to decode is logged and treated as absent rather than poisoning
    /// the room.
    pub async fn ensure_loaded(&mut self) -> RoomResult<()> {
        if self.loaded {
            return Ok(());
        }
        if let Some(bytes) = self.storage.get(&self.room_id).await? {
            match serde_json::from_slice(&bytes) {
                Ok(state) => self.state = state,
                Err(e) => {
                    warn!(room = %self.room_id, "discarding undecodable state blob: {}", e);
                }
            }
        }
        self.loaded = true;
        Ok(())
    }

    /// Apply a delta and persist the result, returning the new version.
    ///
    /// Exactly one storage write per call, empty deltas included. A failed
    /// write is logged at warn and the advanced in-memory state is kept;
    /// the caller broadcasts regardless (optimistic policy).
    pub async fn apply_and_persist(&mut self, delta: &StateDelta) -> u64 {
        self.state = self.state.clone().apply(delta);
        let version = self.state.version;

        match serde_json::to_vec(&self.state) {
            Ok(bytes) => {
                if let Err(e) = self.storage.put(&self.room_id, &bytes).await {
                    warn!(
                        room = %self.room_id,
                        version,
                        "state persist failed, continuing with in-memory state: {}", e
                    );
                }
            }
            Err(e) => {
                warn!(room = %self.room_id, version, "state serialization failed: {}", e);
            }
        }

        version
    }

    pub fn snapshot(&self) -> CanonicalState {
        self.state.clone()
    }

    pub fn current_version(&self) -> u64 {
        self.state.version
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}
