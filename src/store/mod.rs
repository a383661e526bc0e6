//! Adapters over the external stores
//!
//! Durable state lives in Postgres ([`db`]), hot cross-node state in Redis
//! ([`kv`]), and cross-node fan-out rides Redis pub/sub ([`bus`]). All three
//! are injected into the router, pipeline, and presence engine rather than
//! held as globals.

pub mod bus;
pub mod db;
pub mod kv;

pub use bus::EventBus;
pub use db::Database;
pub use kv::KvStore;
