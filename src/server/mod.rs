//! Socket server: per-connection handlers, the local session registry, and
//! node wiring

pub mod connection_handler;
pub mod session_registry;
pub mod socket_server;

pub use session_registry::SessionRegistry;
pub use socket_server::{run, AppState};
