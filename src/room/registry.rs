//! Live-session registry for one room.
//!
//! Tracks the connections currently attached to a room and fans server
//! frames out to them. Delivery is best-effort: a send to a connection
//! whose channel has closed (peer mid-disconnect) is a silent no-op and
//! never aborts the remaining fan-out.

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::protocol::ServerMessage;
use super::ConnId;

/// One live connection's registry entry.
#[derive(Debug)]
pub struct PeerHandle {
    /// Channel feeding this connection's socket pusher task.
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Unix timestamp (seconds) of the connect transition.
    pub connected_at: i64,
}

/// The set of currently-connected peers for a room.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: DashMap<ConnId, PeerHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.peers.insert(
            conn_id.to_string(),
            PeerHandle {
                tx,
                connected_at: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Remove a connection. Returns false if it was not registered.
    pub fn unregister(&self, conn_id: &str) -> bool {
        self.peers.remove(conn_id).is_some()
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connection ids with their connect timestamps, for room listings.
    pub fn peers(&self) -> Vec<(ConnId, i64)> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().connected_at))
            .collect()
    }

    /// Send a frame to one connection. Unknown or closed connections are
    /// ignored.
    pub fn send_to(&self, conn_id: &str, msg: ServerMessage) {
        if let Some(peer) = self.peers.get(conn_id) {
            let _ = peer.tx.send(msg);
        }
    }

    /// Send a frame to every registered connection except the listed ids.
    /// Per-recipient failures are swallowed.
    pub fn broadcast(&self, msg: &ServerMessage, exclude: &[&str]) {
        for peer in self.peers.iter() {
            if exclude.contains(&peer.key().as_str()) {
                continue;
            }
            let _ = peer.value().tx.send(msg.clone());
        }
    }
}
