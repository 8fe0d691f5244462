//! Room coordination: per-room dispatch plus the multi-room server.
//!
//! One [`Room`] instance coordinates one room. Its canonical state sits
//! behind a single async mutex, so state load, delta application, and the
//! matching broadcast form one serialized critical section per room.
//! Frames from different connections interleave at message granularity,
//! never mid-mutation. Rooms are independent entries in the server map and
//! never share state; a slow persistence write stalls only its own room.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use super::protocol::{
    ClientMessage, PresenceEvent, ProtocolError, RoomProtocol, ServerMessage,
};
use super::registry::SessionRegistry;
use super::store::CanonicalStore;
use super::{ConnId, RoomError, RoomId, RoomResult};
use crate::storage::RoomStorage;

/// Configuration for the room server
#[derive(Debug, Clone)]
pub struct RoomServerConfig {
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
    /// How long an empty room's in-memory instance is kept before eviction
    pub empty_room_grace: Duration,
}

impl Default for RoomServerConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 50,
            cleanup_interval: Duration::from_secs(60),
            empty_room_grace: Duration::from_secs(300),
        }
    }
}

/// Coordinator for a single room.
pub struct Room {
    room_id: RoomId,
    /// Canonical state; the mutex serializes every state touch for this room.
    store: Mutex<CanonicalStore>,
    registry: SessionRegistry,
    /// Set when the server evicts this instance; blocks new registrations.
    closed: parking_lot::Mutex<bool>,
    /// Last connect/frame/disconnect, for empty-room eviction.
    last_active: RwLock<Instant>,
}

impl Room {
    fn new(room_id: impl Into<String>, storage: Arc<dyn RoomStorage>) -> Self {
        let room_id = room_id.into();
        Self {
            store: Mutex::new(CanonicalStore::new(room_id.clone(), storage)),
            room_id,
            registry: SessionRegistry::new(),
            closed: parking_lot::Mutex::new(false),
            last_active: RwLock::new(Instant::now()),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.registry.count()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Connection ids with connect timestamps, for room listings.
    pub fn peers(&self) -> Vec<(ConnId, i64)> {
        self.registry.peers()
    }

    /// Current state version, if the state has been loaded this activation.
    pub async fn current_version(&self) -> Option<u64> {
        let store = self.store.lock().await;
        store.is_loaded().then(|| store.current_version())
    }

    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }

    /// Connect transition: lazy state load, register, snapshot to the new
    /// joiner, join presence to everyone else.
    ///
    /// Registration and the snapshot happen under the state lock, so a
    /// concurrent delta is either already in the snapshot or will reach the
    /// joiner as a broadcast, never lost between the two.
    pub async fn connect(
        &self,
        conn_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
        max_peers: usize,
    ) -> RoomResult<()> {
        if self.registry.count() >= max_peers {
            return Err(RoomError::RoomFull(self.room_id.clone()));
        }

        {
            let mut store = self.store.lock().await;
            store.ensure_loaded().await?;
            {
                // Registration and eviction take the same lock: either this
                // peer registers first and the room is no longer empty, or
                // the instance is already closed and the caller retries on
                // a live one.
                let closed = self.closed.lock();
                if *closed {
                    return Err(RoomError::RoomClosed(self.room_id.clone()));
                }
                self.registry.register(conn_id, tx);
            }
            self.registry.send_to(
                conn_id,
                ServerMessage::StateSync {
                    state: store.snapshot(),
                    room: self.room_id.clone(),
                },
            );
        }

        let count = self.registry.count();
        self.registry.broadcast(
            &ServerMessage::Presence {
                event: PresenceEvent::Join,
                id: conn_id.to_string(),
                count,
            },
            &[conn_id],
        );
        self.touch();

        info!(room = %self.room_id, conn = %conn_id, total = count, "peer connected");
        Ok(())
    }

    /// Dispatch one inbound text frame from a connection.
    ///
    /// Only the well-formed `state_delta` path mutates canonical state; a
    /// malformed or unrecognized frame is logged and dropped with the
    /// connection left open.
    pub async fn handle_frame(&self, conn_id: &str, text: &str) {
        let msg = match RoomProtocol::decode_client(text) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(tag)) => {
                warn!(room = %self.room_id, conn = %conn_id, %tag, "dropping frame with unknown type");
                return;
            }
            Err(e) => {
                warn!(room = %self.room_id, conn = %conn_id, "dropping malformed frame: {}", e);
                return;
            }
        };
        self.touch();

        match msg {
            ClientMessage::StateDelta { delta, .. } => {
                let mut store = self.store.lock().await;
                if let Err(e) = store.ensure_loaded().await {
                    warn!(room = %self.room_id, conn = %conn_id, "dropping delta, state load failed: {}", e);
                    return;
                }
                let version = store.apply_and_persist(&delta).await;
                // Broadcast under the lock so deltas reach peers in the
                // order they were applied.
                self.registry.broadcast(
                    &ServerMessage::StateDelta {
                        delta,
                        version,
                        from: conn_id.to_string(),
                    },
                    &[conn_id],
                );
                debug!(room = %self.room_id, conn = %conn_id, version, "delta applied");
            }

            ClientMessage::ChatMsg { sender, text, ts } => {
                let relay = ServerMessage::ChatMsg {
                    sender,
                    text,
                    ts: ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
                    from: conn_id.to_string(),
                };
                self.registry.broadcast(&relay, &[conn_id]);
            }

            ClientMessage::CursorPos { sender, x, y } => {
                let relay = ServerMessage::CursorPos {
                    sender,
                    x,
                    y,
                    from: conn_id.to_string(),
                };
                self.registry.broadcast(&relay, &[conn_id]);
            }

            ClientMessage::Ping => {
                self.registry.send_to(
                    conn_id,
                    ServerMessage::Pong {
                        ts: chrono::Utc::now().timestamp_millis(),
                    },
                );
            }
        }
    }

    /// Disconnect transition: unregister, leave presence to the rest.
    pub fn disconnect(&self, conn_id: &str) {
        if !self.registry.unregister(conn_id) {
            return;
        }
        let remaining = self.registry.count();
        self.registry.broadcast(
            &ServerMessage::Presence {
                event: PresenceEvent::Leave,
                id: conn_id.to_string(),
                count: remaining,
            },
            &[conn_id],
        );
        self.touch();

        info!(room = %self.room_id, conn = %conn_id, remaining, "peer disconnected");
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_rooms: usize,
    pub active_peers: usize,
}

/// The multi-room synchronization server.
pub struct RoomServer {
    config: RoomServerConfig,
    /// Live room instances
    rooms: DashMap<RoomId, Arc<Room>>,
    /// Persistent storage shared by all rooms
    storage: Arc<dyn RoomStorage>,
    /// Shutdown signal for background tasks
    shutdown_tx: broadcast::Sender<()>,
}

impl RoomServer {
    pub fn new(storage: Arc<dyn RoomStorage>, config: RoomServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: DashMap::new(),
            storage,
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_storage(storage: Arc<dyn RoomStorage>) -> Self {
        Self::new(storage, RoomServerConfig::default())
    }

    /// Get or lazily create the in-memory instance for a room. State loads
    /// on first access, not here.
    pub fn room(&self, room_id: &str) -> Arc<Room> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id, self.storage.clone())))
            .clone()
    }

    /// Get a room's live instance if one exists
    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Attach a connection to a room, returning the room for dispatch.
    pub async fn connect(
        &self,
        room_id: &str,
        conn_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> RoomResult<Arc<Room>> {
        loop {
            let room = self.room(room_id);
            match room
                .connect(conn_id, tx.clone(), self.config.max_peers_per_room)
                .await
            {
                Ok(()) => return Ok(room),
                // The instance was evicted between lookup and registration;
                // the next lookup creates a live one.
                Err(RoomError::RoomClosed(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_rooms: self.rooms.len(),
            active_peers: self.rooms.iter().map(|r| r.peer_count()).sum(),
        }
    }

    /// Evict in-memory instances of rooms that have been empty past the
    /// grace period. Safe because persistence is write-through: the room
    /// stays logically active and reloads on the next connect.
    pub fn cleanup(&self) {
        let candidates: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| {
                let room = entry.value();
                room.is_empty() && room.idle_for() > self.config.empty_room_grace
            })
            .map(|entry| entry.key().clone())
            .collect();

        for room_id in candidates {
            // Re-check and close under the instance lock: a peer that
            // registered since the scan keeps the room alive, and one that
            // has not yet registered will observe the closed flag.
            let removed = self.rooms.remove_if(&room_id, |_, room| {
                let mut closed = room.closed.lock();
                if room.is_empty() && room.idle_for() > self.config.empty_room_grace {
                    *closed = true;
                    true
                } else {
                    false
                }
            });
            if removed.is_some() {
                info!(room = %room_id, "evicted idle empty room");
            }
        }
    }

    /// Initiate graceful shutdown of background tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Start the background cleanup loop
    pub fn start_background_tasks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup();
                    }
                    _ = shutdown.recv() => {
                        info!("cleanup task shutting down");
                        break;
                    }
                }
            }
        })
    }
}
