//! Wire protocol: typed client/server events and shared payload shapes

pub mod events;

pub use events::{
    validate_content, BusEnvelope, ClientEvent, ConnectionId, MessageKind, PageLimits,
    PresenceInfo, PresenceStatus, RoomSummary, RoomUpdateKind, ServerEvent, WireMessage,
    MAX_CONTENT_LEN,
};
