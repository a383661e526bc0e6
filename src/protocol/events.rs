//! Protocol event types for the chat system
//!
//! The wire format is JSON text frames shaped as
//! `{"event": "<name>", "data": {...}}` in both directions. Payload shape is
//! validated at this boundary; handlers downstream only ever see well-formed
//! events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Unique identifier for a single socket connection on a node
pub type ConnectionId = Uuid;

/// Maximum accepted message body length, in characters
pub const MAX_CONTENT_LEN: usize = 4000;

/// Page size bounds for history reads
#[derive(Debug, Clone, Copy)]
pub struct PageLimits;

impl PageLimits {
    pub const DEFAULT: usize = 50;
    pub const MAX: usize = 100;

    /// Clamp a client-requested limit into the allowed range
    pub fn clamp(requested: Option<u32>) -> usize {
        match requested {
            Some(0) | None => Self::DEFAULT,
            Some(n) => (n as usize).min(Self::MAX),
        }
    }
}

/// Online/offline belief about a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(PresenceStatus::Online),
            "offline" => Some(PresenceStatus::Offline),
            _ => None,
        }
    }
}

/// A user's presence as shown to room members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub user_id: Uuid,
    pub username: String,
    pub status: PresenceStatus,
    /// Unix timestamp (seconds) of the last observed activity
    pub last_seen: i64,
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(MessageKind::Text),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// A chat message as delivered to clients (and as cached in the fast store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    /// None for system messages
    pub user_id: Option<Uuid>,
    /// None for system messages
    pub username: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// Room metadata as returned by room listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Client → server events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        room_id: Uuid,
        #[serde(default)]
        already_joined: bool,
    },
    LeaveRoom {
        room_id: Uuid,
    },
    SendMessage {
        room_id: Uuid,
        content: String,
    },
    LoadMoreMessages {
        room_id: Uuid,
        limit: Option<u32>,
        before: Option<Uuid>,
    },
    TypingStart {
        room_id: Uuid,
    },
    TypingStop {
        room_id: Uuid,
    },
    Heartbeat,
    GetRoomPresences {
        room_id: Uuid,
    },
    GetMyRooms,
}

impl ClientEvent {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::LeaveRoom { .. } => "leave_room",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::LoadMoreMessages { .. } => "load_more_messages",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::Heartbeat => "heartbeat",
            ClientEvent::GetRoomPresences { .. } => "get_room_presences",
            ClientEvent::GetMyRooms => "get_my_rooms",
        }
    }

    /// Parse a raw text frame into an event
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ChatError::validation(format!("unrecognized event: {}", e)))
    }
}

/// What changed in a room, carried inside a `room_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomUpdateKind {
    NewMessage,
    UserJoined,
    UserLeft,
    UserConnected,
    UserDisconnected,
}

/// Server → client events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomJoined {
        room_id: Uuid,
        presences: Vec<PresenceInfo>,
    },
    RoomLeft {
        room_id: Uuid,
    },
    RoomUpdate {
        #[serde(rename = "type")]
        kind: RoomUpdateKind,
        room_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<WireMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        presences: Option<Vec<PresenceInfo>>,
    },
    RecentMessages {
        room_id: Uuid,
        messages: Vec<WireMessage>,
        has_more: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<Uuid>,
    },
    MoreMessagesLoaded {
        room_id: Uuid,
        messages: Vec<WireMessage>,
        has_more: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<Uuid>,
    },
    RoomPresences {
        room_id: Uuid,
        presences: Vec<PresenceInfo>,
    },
    MyRooms {
        rooms: Vec<RoomSummary>,
    },
    UserTyping {
        user_id: Uuid,
        username: String,
        room_id: Uuid,
        is_typing: bool,
    },
    HeartbeatAck,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerEvent {
    /// Build the error reply for a failed command
    pub fn from_error(err: &ChatError) -> Self {
        ServerEvent::Error {
            message: err.client_message().to_string(),
            code: Some(err.code().to_string()),
        }
    }

    /// A `room_update` carrying a freshly persisted message
    pub fn new_message(message: WireMessage) -> Self {
        ServerEvent::RoomUpdate {
            kind: RoomUpdateKind::NewMessage,
            room_id: message.room_id,
            message: Some(message),
            presences: None,
        }
    }

    /// A `room_update` carrying a presence change and the room's new snapshot
    pub fn presence_change(
        kind: RoomUpdateKind,
        room_id: Uuid,
        presences: Vec<PresenceInfo>,
    ) -> Self {
        ServerEvent::RoomUpdate {
            kind,
            room_id,
            message: None,
            presences: Some(presences),
        }
    }

    /// Serialize to a text frame
    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ChatError::downstream(format!("failed to encode event: {}", e)))
    }
}

/// Cross-node fan-out envelope published on the bus
///
/// `exclude` names the originating connection so per-socket exclusion (typing
/// indicators) survives the trip through Redis; only the origin node holds
/// that connection, every other node ignores the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub room_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<ConnectionId>,
    pub event: ServerEvent,
}

/// Validate and normalize a message body
pub fn validate_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::validation("message content must not be empty"));
    }
    if trimmed.chars().count() > MAX_CONTENT_LEN {
        return Err(ChatError::validation(format!(
            "message content exceeds {} characters",
            MAX_CONTENT_LEN
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_event() {
        let raw = r#"{"event":"send_message","data":{"room_id":"7f8dfd8c-2b52-4a33-a3a1-2ad96e0b0838","content":"hi"}}"#;
        match ClientEvent::parse(raw).unwrap() {
            ClientEvent::SendMessage { content, .. } => assert_eq!(content, "hi"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_parses_without_data() {
        let event = ClientEvent::parse(r#"{"event":"heartbeat"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Heartbeat));
    }

    #[test]
    fn test_join_room_defaults_already_joined() {
        let raw = r#"{"event":"join_room","data":{"room_id":"7f8dfd8c-2b52-4a33-a3a1-2ad96e0b0838"}}"#;
        match ClientEvent::parse(raw).unwrap() {
            ClientEvent::JoinRoom { already_joined, .. } => assert!(!already_joined),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = ClientEvent::parse(r#"{"event":"self_destruct"}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_room_update_wire_shape() {
        let room_id = Uuid::new_v4();
        let event = ServerEvent::presence_change(RoomUpdateKind::UserJoined, room_id, vec![]);
        let frame = event.to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "room_update");
        assert_eq!(value["data"]["type"], "user_joined");
        assert!(value["data"].get("message").is_none());
    }

    #[test]
    fn test_message_round_trip_preserves_fields() {
        let msg = WireMessage {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            username: Some("alice".to_string()),
            content: "hello there".to_string(),
            kind: MessageKind::Text,
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.user_id, msg.user_id);
        assert_eq!(decoded.username, msg.username);
        assert_eq!(decoded.content, msg.content);
        assert_eq!(decoded.kind, msg.kind);
        assert_eq!(decoded.created_at, msg.created_at);
    }

    #[test]
    fn test_validate_content_rejects_whitespace() {
        assert!(validate_content("   \n\t ").is_err());
        assert!(validate_content("").is_err());
        assert_eq!(validate_content("  hi  ").unwrap(), "hi");
    }

    #[test]
    fn test_bus_envelope_round_trip() {
        let envelope = BusEnvelope {
            room_id: Uuid::new_v4(),
            exclude: Some(Uuid::new_v4()),
            event: ServerEvent::HeartbeatAck,
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: BusEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.room_id, envelope.room_id);
        assert_eq!(decoded.exclude, envelope.exclude);
    }

    #[test]
    fn test_page_limit_clamping() {
        assert_eq!(PageLimits::clamp(None), 50);
        assert_eq!(PageLimits::clamp(Some(0)), 50);
        assert_eq!(PageLimits::clamp(Some(20)), 20);
        assert_eq!(PageLimits::clamp(Some(500)), 100);
    }
}
