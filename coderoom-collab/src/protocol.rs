//! Wire protocol for room synchronization.
//!
//! Every event travels as one binary WebSocket frame, bincode-encoded:
//! ```text
//! client ──► relay                      relay ──► client(s)
//! ┌──────────────────────────────┐      ┌──────────────────────────────────────┐
//! │ Join     { room_id, name }   │      │ Joined       { members, joiner, … }  │
//! │ CodeChange { room_id, text } │      │ CodeChange   { text, from }          │
//! │ SyncCode { text, target }    │      │ Disconnected { connection_id, name } │
//! └──────────────────────────────┘      └──────────────────────────────────────┘
//! ```
//!
//! The two directions are separate enums so that a client can never
//! address a relay-only event (and vice versa) at compile time.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Transport-assigned identity of one connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque room token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh room token (random v4 UUID in hyphenated form).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only tokens cannot name a room.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One connected user within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub room_id: RoomId,
}

impl Participant {
    pub fn new(
        connection_id: ConnectionId,
        display_name: impl Into<String>,
        room_id: RoomId,
    ) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
            room_id,
        }
    }
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Enter a room under a display name.
    Join { room_id: RoomId, display_name: String },
    /// Full document text after a local edit.
    CodeChange { room_id: RoomId, text: String },
    /// Current document text, addressed to a single newcomer.
    SyncCode { text: String, target: ConnectionId },
}

impl ClientEvent {
    pub fn join(room_id: impl Into<RoomId>, display_name: impl Into<String>) -> Self {
        Self::Join {
            room_id: room_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn code_change(room_id: impl Into<RoomId>, text: impl Into<String>) -> Self {
        Self::CodeChange {
            room_id: room_id.into(),
            text: text.into(),
        }
    }

    pub fn sync_code(text: impl Into<String>, target: ConnectionId) -> Self {
        Self::SyncCode {
            text: text.into(),
            target,
        }
    }

    /// Short event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::CodeChange { .. } => "code-change",
            Self::SyncCode { .. } => "sync-code",
        }
    }

    /// Reject events whose required fields are present but empty.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Join { room_id, display_name } => {
                if room_id.is_blank() {
                    return Err(ProtocolError::MalformedEvent("join without room id".into()));
                }
                if display_name.trim().is_empty() {
                    return Err(ProtocolError::MalformedEvent(
                        "join without display name".into(),
                    ));
                }
                Ok(())
            }
            Self::CodeChange { room_id, .. } if room_id.is_blank() => Err(
                ProtocolError::MalformedEvent("code-change without room id".into()),
            ),
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Decode and validate a frame received from a client.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let event: Self = decode_frame(bytes)?;
        event.validate()?;
        Ok(event)
    }
}

/// Events the relay delivers to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayEvent {
    /// Someone joined; `members` is the complete room roster in join order.
    Joined {
        members: Vec<Participant>,
        joiner: ConnectionId,
        joiner_name: String,
    },
    /// Replacement document text from another participant.
    CodeChange { text: String, from: ConnectionId },
    /// A participant's connection ended.
    Disconnected {
        connection_id: ConnectionId,
        display_name: String,
    },
}

impl RelayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::CodeChange { .. } => "code-change",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::MalformedEvent(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::MalformedEvent(format!(
            "{} trailing bytes after event",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_roundtrip() {
        let event = ClientEvent::join("r1", "Alice");
        let decoded = ClientEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.kind(), "join");
    }

    #[test]
    fn test_joined_preserves_member_order() {
        let room = RoomId::new("r1");
        let a = Participant::new(ConnectionId::new(), "Alice", room.clone());
        let b = Participant::new(ConnectionId::new(), "Bob", room);
        let event = RelayEvent::Joined {
            members: vec![a.clone(), b.clone()],
            joiner: b.connection_id,
            joiner_name: "Bob".into(),
        };

        match RelayEvent::decode(&event.encode().unwrap()).unwrap() {
            RelayEvent::Joined { members, joiner, joiner_name } => {
                assert_eq!(members, vec![a, b.clone()]);
                assert_eq!(joiner, b.connection_id);
                assert_eq!(joiner_name, "Bob");
            }
            other => panic!("Expected Joined, got {other:?}"),
        }
    }

    #[test]
    fn test_code_change_keeps_unicode_text() {
        let from = ConnectionId::new();
        let event = RelayEvent::CodeChange {
            text: "let s = \"héllo 🌍\";\n".into(),
            from,
        };
        let decoded = RelayEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            ClientEvent::decode(&garbage),
            Err(ProtocolError::MalformedEvent(_))
        ));
        assert!(matches!(
            RelayEvent::decode(&garbage),
            Err(ProtocolError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_decode_empty_frame() {
        assert!(ClientEvent::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = ClientEvent::code_change("r1", "x").encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            ClientEvent::decode(&bytes),
            Err(ProtocolError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_blank_join_is_malformed() {
        let no_room = ClientEvent::join("  ", "Alice").encode().unwrap();
        let no_name = ClientEvent::join("r1", "").encode().unwrap();
        assert!(matches!(
            ClientEvent::decode(&no_room),
            Err(ProtocolError::MalformedEvent(_))
        ));
        assert!(matches!(
            ClientEvent::decode(&no_name),
            Err(ProtocolError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_sync_code_needs_no_room() {
        let event = ClientEvent::sync_code("", ConnectionId::new());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_generated_room_ids_are_distinct() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_ne!(a, b);
        assert!(!a.is_blank());
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_connection_ids_are_distinct() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_code_change_size_efficient() {
        let event = ClientEvent::code_change(RoomId::generate(), "x".repeat(50));
        let encoded = event.encode().unwrap();
        // tag + 36-byte room id + 50-byte text + length prefixes
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }
}
