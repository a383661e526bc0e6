//! Chorus - Horizontally Scalable Chat Backend
//!
//! This library provides a multi-room chat backend designed to run as N
//! interchangeable nodes behind a load balancer. Clients hold one WebSocket
//! to any node; the nodes cooperate through a shared Redis instance so that
//! messages, presence changes, and typing signals originating on one node
//! reach subscribers attached to every other node.
//!
//! ## Architecture
//!
//! - **Durable state** (users, rooms, memberships, the message log) lives in
//!   Postgres and is the single source of truth.
//! - **Hot state** (presence records, heartbeats, the recent-message cache,
//!   room membership snapshots) lives in Redis with TTLs.
//! - **Fan-out** rides Redis pub/sub: one topic per room, one pattern
//!   subscription per node.
//! - **Presence** is heartbeat-driven; a per-node reaper demotes users whose
//!   heartbeats go stale, with the online-users set acting as the
//!   cluster-wide commit point so each offline transition broadcasts once.
//! - **History reads** stitch the bounded per-room cache with the durable
//!   log under a strict cursor boundary.
//!
//! ## Example
//!
//! ```rust,ignore
//! use chorus::{config::Config, server};
//!
//! #[tokio::main]
//! async fn main() -> chorus::Result<()> {
//!     let config = Config::from_env()?;
//!     server::run(config).await
//! }
//! ```

// Core modules
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;

// Store adapters
pub mod store;

// Engines
pub mod pipeline;
pub mod presence;
pub mod rooms;

// Server modules
pub mod rest;
pub mod server;

// Re-export error types
pub use error::{ChatError, Result};

// Re-export protocol types
pub use protocol::{
    BusEnvelope, ClientEvent, ConnectionId, MessageKind, PresenceInfo, PresenceStatus,
    RoomSummary, RoomUpdateKind, ServerEvent, WireMessage,
};

// Re-export the long-lived per-node pieces
pub use pipeline::{MessagePage, MessagePipeline};
pub use presence::PresenceEngine;
pub use rooms::RoomService;
pub use server::{AppState, SessionRegistry};
pub use store::{Database, EventBus, KvStore};
