//! Tagged messages traversing the Hub, and the DTOs sent back to clients.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Closed set of message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Global chat message (skips the sender on delivery).
    Chat,
    /// Global join notification.
    Join,
    /// Global leave notification.
    Leave,
    /// Room-scoped chat message (skips the sender on delivery).
    RoomMessage,
    /// Room-scoped join notification.
    RoomJoin,
    /// Room-scoped leave notification.
    RoomLeave,
    /// Global room-deletion notification.
    DeleteRoom,
    /// Room descriptor synchronization across servers.
    RoomSync,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Chat => "chat",
            EnvelopeKind::Join => "join",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::RoomMessage => "room_message",
            EnvelopeKind::RoomJoin => "room_join",
            EnvelopeKind::RoomLeave => "room_leave",
            EnvelopeKind::DeleteRoom => "delete_room",
            EnvelopeKind::RoomSync => "room_sync",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "chat" => EnvelopeKind::Chat,
            "join" => EnvelopeKind::Join,
            "leave" => EnvelopeKind::Leave,
            "room_message" => EnvelopeKind::RoomMessage,
            "room_join" => EnvelopeKind::RoomJoin,
            "room_leave" => EnvelopeKind::RoomLeave,
            "delete_room" => EnvelopeKind::DeleteRoom,
            "room_sync" => EnvelopeKind::RoomSync,
            _ => return None,
        })
    }
}

/// A tagged message traversing the Hub.
///
/// `message_id` is `None` for locally originated envelopes; a populated id
/// marks the envelope as bus-originated or synthesized, and such envelopes
/// are never republished to the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: Option<String>,
    pub content: String,
    pub kind: EnvelopeKind,
    pub sender: Option<SessionId>,
    /// Target room name. `None` routes through the global Broadcast path.
    pub target: Option<String>,
    /// Origin server id. `None` for local origin.
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// A locally originated envelope with no message id.
    pub fn local(kind: EnvelopeKind, content: impl Into<String>) -> Self {
        Self {
            message_id: None,
            content: content.into(),
            kind,
            sender: None,
            target: None,
            origin: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_sender(kind: EnvelopeKind, content: impl Into<String>, sender: SessionId) -> Self {
        Self {
            sender: Some(sender),
            ..Self::local(kind, content)
        }
    }

    /// A notification carrying a synthesized message id so the bus bridge
    /// never echoes it.
    pub fn synthesized(kind: EnvelopeKind, content: impl Into<String>) -> Self {
        Self {
            message_id: Some(parlor_common::id::prefixed_ulid(
                parlor_common::id::prefix::MESSAGE,
            )),
            ..Self::local(kind, content)
        }
    }
}

/// Room descriptor returned for `list_rooms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub name: String,
    pub private: bool,
    #[serde(rename = "clientCount")]
    pub client_count: usize,
    #[serde(rename = "isCreator")]
    pub is_creator: bool,
}

/// A persisted message returned for `get_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Wall-clock `[HH:MM:SS]` prefix used on human-readable frames.
pub fn clock_prefix() -> String {
    format!("[{}]", Local::now().format("%H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            EnvelopeKind::Chat,
            EnvelopeKind::Join,
            EnvelopeKind::Leave,
            EnvelopeKind::RoomMessage,
            EnvelopeKind::RoomJoin,
            EnvelopeKind::RoomLeave,
            EnvelopeKind::DeleteRoom,
            EnvelopeKind::RoomSync,
        ] {
            assert_eq!(EnvelopeKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EnvelopeKind::from_str("presence"), None);
    }

    #[test]
    fn synthesized_envelopes_carry_a_message_id() {
        let env = Envelope::synthesized(EnvelopeKind::RoomJoin, "x joined");
        assert!(env.message_id.as_deref().unwrap().starts_with("msg_"));
        assert!(env.origin.is_none());
    }

    #[test]
    fn room_summary_uses_wire_field_names() {
        let summary = RoomSummary {
            name: "alpha".into(),
            private: false,
            client_count: 1,
            is_creator: true,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"clientCount\":1"));
        assert!(json.contains("\"isCreator\":true"));
    }
}
