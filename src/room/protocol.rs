//! JSON wire protocol for room traffic.
//!
//! All peer traffic travels as JSON text frames tagged by a `type`
//! discriminant:
//!
//!   client -> server: `state_delta`, `chat_msg`, `cursor_pos`, `ping`
//!   server -> client: `state_sync`, `state_delta`, `chat_msg`,
//!                     `cursor_pos`, `presence`, `pong`
//!
//! Decoding distinguishes malformed frames from frames with an unrecognized
//! discriminant; the coordinator logs and drops both without touching room
//! state or the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::state::{CanonicalState, StateDelta};

/// Errors raised by the codec
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A window-layout mutation to merge, persist, and re-broadcast.
    StateDelta {
        /// Some clients echo the room id they believe they are in; the
        /// socket path already names the room, so this is ignored.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        delta: StateDelta,
    },

    /// Chat line, relayed to everyone else. The server stamps `ts`
    /// (milliseconds since epoch) when the sender omits it.
    ChatMsg {
        sender: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },

    /// Terminal cursor position (row/col), relayed verbatim.
    CursorPos { sender: String, x: i64, y: i64 },

    /// Keepalive; answered with a unicast `pong`.
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full canonical state, sent once to a peer immediately after connect.
    StateSync { state: CanonicalState, room: String },

    /// A merged delta enriched with the new version and the originating
    /// connection id, broadcast to everyone except the sender.
    StateDelta {
        delta: StateDelta,
        version: u64,
        from: String,
    },

    ChatMsg {
        sender: String,
        text: String,
        ts: i64,
        from: String,
    },

    CursorPos {
        sender: String,
        x: i64,
        y: i64,
        from: String,
    },

    /// Connection lifecycle notification with the updated peer count.
    Presence {
        event: PresenceEvent,
        id: String,
        count: usize,
    },

    Pong { ts: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Join,
    Leave,
}

/// Discriminants the server accepts from clients; anything else decodes to
/// [`ProtocolError::UnknownType`].
const CLIENT_TYPES: &[&str] = &["state_delta", "chat_msg", "cursor_pos", "ping"];

/// Codec for the JSON message envelope.
pub struct RoomProtocol;

impl RoomProtocol {
    /// Decode a client frame.
    ///
    /// Bad JSON, a missing `type` discriminant, or missing/invalid fields
    /// all classify as `Malformed`; a well-formed envelope with a tag the
    /// server does not know classifies as `UnknownType`.
    pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing type discriminant".to_string()))?;

        if !CLIENT_TYPES.contains(&tag) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode a server frame as a JSON text payload.
    pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
        serde_json::to_string(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::state::WindowState;

    #[test]
    fn test_decode_state_delta() {
        let text = r#"{
            "type": "state_delta",
            "room_id": "lobby",
            "delta": {
                "add": [{"id": "w1", "type": "terminal", "x": 0, "y": 0, "w": 80, "h": 24}],
                "remove": ["w2"]
            }
        }"#;

        match RoomProtocol::decode_client(text).unwrap() {
            ClientMessage::StateDelta { room_id, delta } => {
                assert_eq!(room_id.as_deref(), Some("lobby"));
                assert_eq!(delta.add.len(), 1);
                assert_eq!(delta.add[0].id, "w1");
                assert_eq!(delta.remove, vec!["w2".to_string()]);
                assert!(delta.update.is_empty());
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_empty_delta() {
        let msg = RoomProtocol::decode_client(r#"{"type": "state_delta", "delta": {}}"#).unwrap();
        match msg {
            ClientMessage::StateDelta { delta, .. } => assert!(delta.is_empty()),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_chat_without_ts() {
        let msg = RoomProtocol::decode_client(
            r#"{"type": "chat_msg", "sender": "alice", "text": "hello"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ChatMsg {
                sender: "alice".to_string(),
                text: "hello".to_string(),
                ts: None,
            }
        );
    }

    #[test]
    fn test_decode_cursor_and_ping() {
        let msg = RoomProtocol::decode_client(
            r#"{"type": "cursor_pos", "sender": "bob", "x": 12, "y": 3}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CursorPos {
                sender: "bob".to_string(),
                x: 12,
                y: 3,
            }
        );

        let msg = RoomProtocol::decode_client(r#"{"type": "ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_malformed_frames() {
        for text in [
            "not json at all",
            "{}",
            r#"{"type": 7}"#,
            r#"{"type": "chat_msg", "sender": "alice"}"#,
            r#"{"type": "state_delta"}"#,
        ] {
            match RoomProtocol::decode_client(text) {
                Err(ProtocolError::Malformed(_)) => {}
                other => panic!("expected malformed for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_type() {
        let result = RoomProtocol::decode_client(r#"{"type": "launch_missiles"}"#);
        match result {
            Err(ProtocolError::UnknownType(tag)) => assert_eq!(tag, "launch_missiles"),
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_state_sync() {
        let state = CanonicalState::default().apply(&StateDelta {
            add: vec![WindowState::new("w1").with_kind("terminal")],
            ..Default::default()
        });
        let text = RoomProtocol::encode_server(&ServerMessage::StateSync {
            state,
            room: "lobby".to_string(),
        })
        .unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "state_sync");
        assert_eq!(value["room"], "lobby");
        assert_eq!(value["state"]["version"], 1);
        assert_eq!(value["state"]["windows"]["w1"]["type"], "terminal");
    }

    #[test]
    fn test_encode_presence_and_pong() {
        let text = RoomProtocol::encode_server(&ServerMessage::Presence {
            event: PresenceEvent::Join,
            id: "conn-1".to_string(),
            count: 3,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "presence");
        assert_eq!(value["event"], "join");
        assert_eq!(value["count"], 3);

        let text = RoomProtocol::encode_server(&ServerMessage::Pong { ts: 1700000000000 }).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["ts"], 1700000000000i64);
    }

    #[test]
    fn test_encoded_delta_broadcast_shape() {
        let delta = StateDelta {
            remove: vec!["w1".to_string()],
            ..Default::default()
        };
        let text = RoomProtocol::encode_server(&ServerMessage::StateDelta {
            delta,
            version: 9,
            from: "conn-7".to_string(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "state_delta");
        assert_eq!(value["version"], 9);
        assert_eq!(value["from"], "conn-7");
        assert_eq!(value["delta"]["remove"][0], "w1");
        // Empty phases are omitted rather than sent as empty arrays.
        assert!(value["delta"].get("add").is_none());
    }
}
