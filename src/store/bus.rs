//! Cross-node pub/sub bus
//!
//! Room-scoped events ride Redis pub/sub on one topic per room, so a node
//! holds exactly one pattern subscription and receives traffic for every
//! room — including its own publishes, which is what delivers a broadcast
//! back to the publishing node's local sockets. Delivery is best-effort,
//! at-most-once, in publisher order for a given publisher.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::protocol::BusEnvelope;

/// Topic carrying all events for one room
pub fn topic(room_id: Uuid) -> String {
    format!("room:{}", room_id)
}

/// Pattern matching every room topic
const ROOM_PATTERN: &str = "room:*";

/// Publisher half of the bus. Cheap to clone; the subscriber half runs on a
/// dedicated connection (see [`spawn_subscriber`]).
#[derive(Clone)]
pub struct EventBus {
    conn: ConnectionManager,
}

impl EventBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Publish an envelope to its room topic. Errors are surfaced to the
    /// caller, which decides whether the loss matters; the router never
    /// retries a broadcast.
    pub async fn publish(&self, envelope: &BusEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| ChatError::downstream(format!("failed to encode envelope: {}", e)))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic(envelope.room_id), payload)
            .await?;
        Ok(())
    }
}

/// Start the node's subscriber task. Every envelope published to any room
/// topic is decoded and forwarded on the returned channel; the socket layer
/// drains it into the local session registry. The task resubscribes with
/// backoff if the connection drops, dropping whatever was published in the
/// gap (at-most-once).
pub fn spawn_subscriber(url: String) -> (JoinHandle<()>, mpsc::UnboundedReceiver<BusEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        loop {
            match subscribe_loop(&url, &tx).await {
                Ok(()) => {
                    debug!("bus subscriber channel closed, stopping");
                    break;
                }
                Err(e) => {
                    error!("bus subscriber error, reconnecting: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    });

    (handle, rx)
}

async fn subscribe_loop(url: &str, tx: &mpsc::UnboundedSender<BusEnvelope>) -> Result<()> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(ROOM_PATTERN).await?;
    debug!("bus subscribed to {}", ROOM_PATTERN);

    use futures_util::StreamExt;
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping unreadable bus payload: {}", e);
                continue;
            }
        };
        let envelope: BusEnvelope = match serde_json::from_str(&payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("dropping malformed bus envelope: {}", e);
                continue;
            }
        };
        if tx.send(envelope).is_err() {
            // Receiver gone; the node is shutting down.
            return Ok(());
        }
    }

    Err(ChatError::downstream("bus subscription stream ended"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_naming() {
        let id = Uuid::nil();
        assert_eq!(topic(id), "room:00000000-0000-0000-0000-000000000000");
    }
}
