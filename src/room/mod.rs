//! Room state-synchronization core.
//!
//! A room is an isolated collaboration session: a canonical window set with
//! a monotonic version, a registry of live connections, and the dispatch
//! logic tying them together. This module provides:
//! - The canonical state model and the pure delta merge engine
//! - Lazy-loading, write-through canonical store
//! - Per-room session registry with broadcast-except semantics
//! - The room coordinator and multi-room server

pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;

pub use server::{RoomServer, RoomServerConfig};

use thiserror::Error;

use crate::storage::StorageError;

/// Unique identifier for a room
pub type RoomId = String;

/// Unique identifier for a live connection; never reused across reconnects
pub type ConnId = String;

/// Result type for room operations
pub type RoomResult<T> = Result<T, RoomError>;

/// Errors that can occur in the room core
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room is full: {0}")]
    RoomFull(RoomId),

    /// The in-memory instance was evicted between lookup and registration.
    #[error("room instance closed: {0}")]
    RoomClosed(RoomId),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
