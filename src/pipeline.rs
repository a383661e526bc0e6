//! Message pipeline
//!
//! Writes are hybrid: a synchronous durable append (the commit point),
//! followed by a best-effort cache mirror and a best-effort fan-out emit.
//! Reads stitch the recent-message cache with the durable log under a strict
//! `(created_at, id)` boundary so no message is ever returned twice, and
//! reseed the cache when it has gone cold.

use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::error::Result;
use crate::protocol::{BusEnvelope, MessageKind, ServerEvent, WireMessage};
use crate::store::bus::EventBus;
use crate::store::db::Database;
use crate::store::kv::KvStore;

/// One page of history
#[derive(Debug, Clone)]
pub struct MessagePage {
    /// Chronological (oldest first)
    pub messages: Vec<WireMessage>,
    pub has_more: bool,
    /// Oldest returned id, present when `has_more`
    pub next_cursor: Option<Uuid>,
}

impl MessagePage {
    fn empty() -> Self {
        Self {
            messages: Vec::new(),
            has_more: false,
            next_cursor: None,
        }
    }
}

/// Durable append + cache mirror + hybrid read path
#[derive(Clone)]
pub struct MessagePipeline {
    db: Database,
    kv: KvStore,
    bus: EventBus,
    cache_size: usize,
}

impl MessagePipeline {
    pub fn new(db: Database, kv: KvStore, bus: EventBus, cache_size: usize) -> Self {
        Self {
            db,
            kv,
            bus,
            cache_size,
        }
    }

    /// Persist a message, mirror it into the room cache, and emit
    /// `new_message` to the room.
    ///
    /// The database append must succeed; cache and emit failures are logged
    /// and swallowed, never retried. The next reader repopulates the cache
    /// from the durable log.
    pub async fn create_message(
        &self,
        room_id: Uuid,
        author: Option<&AuthedUser>,
        content: &str,
        kind: MessageKind,
    ) -> Result<WireMessage> {
        let user_id = author.map(|u| u.id);
        let (id, created_at) = self.db.insert_message(room_id, user_id, content, kind).await?;

        let message = WireMessage {
            id,
            room_id,
            user_id,
            username: author.map(|u| u.username.clone()),
            content: content.to_string(),
            kind,
            created_at,
        };

        match serde_json::to_string(&message) {
            Ok(payload) => {
                if let Err(e) = self.kv.recent_push(room_id, &payload).await {
                    warn!(room_id = %room_id, "cache push failed: {}", e);
                }
            }
            Err(e) => warn!(room_id = %room_id, "cache encode failed: {}", e),
        }

        let envelope = BusEnvelope {
            room_id,
            exclude: None,
            event: ServerEvent::new_message(message.clone()),
        };
        if let Err(e) = self.bus.publish(&envelope).await {
            warn!(room_id = %room_id, "new_message emit failed: {}", e);
        }

        Ok(message)
    }

    /// Up to `limit` newest messages in chronological order, served from the
    /// cache where possible and stitched with strictly-older rows from the
    /// durable log where not.
    pub async fn recent(&self, room_id: Uuid, limit: usize) -> Result<MessagePage> {
        if limit == 0 {
            return Ok(MessagePage::empty());
        }

        let raw = self.kv.recent_range(room_id, limit).await?;
        let cached = decode_cached(room_id, raw);

        let messages = if cached.len() >= limit {
            cached
        } else if !cached.is_empty() {
            // The boundary is strict: only rows older than the oldest cached
            // entry, so the stitch never duplicates.
            let oldest = &cached[0];
            let older = self
                .db
                .messages_before(room_id, oldest.created_at, oldest.id, limit - cached.len())
                .await?;
            let mut stitched: Vec<WireMessage> =
                older.iter().rev().map(|row| row.to_wire()).collect();
            stitched.extend(cached);
            stitched
        } else {
            let rows = self.db.newest_messages(room_id, limit).await?;
            let chronological: Vec<WireMessage> =
                rows.iter().rev().map(|row| row.to_wire()).collect();
            self.seed_cache(room_id, &chronological).await;
            chronological
        };

        let (has_more, next_cursor) = if messages.len() < limit {
            (false, None)
        } else {
            let oldest = &messages[0];
            let more = self
                .db
                .has_older(room_id, oldest.created_at, oldest.id)
                .await?;
            (more, more.then(|| oldest.id))
        };

        Ok(MessagePage {
            messages,
            has_more,
            next_cursor,
        })
    }

    /// A page of messages strictly older than `before_id`, bypassing the
    /// cache. An unknown cursor yields an empty page.
    pub async fn older(&self, room_id: Uuid, limit: usize, before_id: Uuid) -> Result<MessagePage> {
        if limit == 0 {
            return Ok(MessagePage::empty());
        }

        let Some((before_created_at, before_id)) =
            self.db.message_cursor(room_id, before_id).await?
        else {
            return Ok(MessagePage::empty());
        };

        // Fetch one extra row to learn whether an older page exists.
        let rows = self
            .db
            .messages_before(room_id, before_created_at, before_id, limit + 1)
            .await?;
        let wire: Vec<WireMessage> = rows.iter().map(|row| row.to_wire()).collect();
        Ok(page_from_newest_first(wire, limit))
    }

    /// Warm a room's cache from the durable log if it is cold. Spawned on
    /// first join; best-effort and never blocks the join reply.
    pub async fn preload(&self, room_id: Uuid) -> Result<()> {
        if self.kv.recent_exists(room_id).await? {
            return Ok(());
        }
        let rows = self.db.newest_messages(room_id, self.cache_size).await?;
        let chronological: Vec<WireMessage> = rows.iter().rev().map(|row| row.to_wire()).collect();
        self.seed_cache(room_id, &chronological).await;
        Ok(())
    }

    /// Drop one author's messages from a room's cache (leave-purge policy).
    pub async fn purge_author(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        let raw = self.kv.recent_all(room_id).await?;
        if raw.is_empty() {
            return Ok(());
        }
        let kept: Vec<WireMessage> = decode_cached(room_id, raw)
            .into_iter()
            .filter(|m| m.user_id != Some(user_id))
            .collect();
        if kept.is_empty() {
            self.kv.recent_delete(room_id).await
        } else {
            let payloads = encode_chronological(&kept);
            self.kv.recent_seed(room_id, &payloads).await
        }
    }

    async fn seed_cache(&self, room_id: Uuid, chronological: &[WireMessage]) {
        if chronological.is_empty() {
            return;
        }
        let payloads = encode_chronological(chronological);
        if let Err(e) = self.kv.recent_seed(room_id, &payloads).await {
            warn!(room_id = %room_id, "cache seed failed: {}", e);
        }
    }
}

/// Decode newest-first cache entries into chronological order, dropping
/// anything that no longer parses.
fn decode_cached(room_id: Uuid, raw: Vec<String>) -> Vec<WireMessage> {
    let mut messages: Vec<WireMessage> = raw
        .into_iter()
        .filter_map(|payload| match serde_json::from_str(&payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(room_id = %room_id, "dropping malformed cache entry: {}", e);
                None
            }
        })
        .collect();
    messages.reverse();
    messages
}

fn encode_chronological(messages: &[WireMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| serde_json::to_string(m).ok())
        .collect()
}

/// Turn an N+1 newest-first fetch into a chronological page
fn page_from_newest_first(mut newest_first: Vec<WireMessage>, limit: usize) -> MessagePage {
    let has_more = newest_first.len() > limit;
    newest_first.truncate(limit);
    newest_first.reverse();
    let next_cursor = if has_more {
        newest_first.first().map(|m| m.id)
    } else {
        None
    };
    MessagePage {
        messages: newest_first,
        has_more,
        next_cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn message(seq: i64) -> WireMessage {
        WireMessage {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            user_id: Some(Uuid::new_v4()),
            username: Some("alice".to_string()),
            content: format!("message {}", seq),
            kind: MessageKind::Text,
            created_at: Utc::now() + ChronoDuration::seconds(seq),
        }
    }

    #[test]
    fn test_page_from_newest_first_with_more() {
        // 4 rows fetched for limit 3: one extra means another page exists.
        let newest_first: Vec<WireMessage> = (0..4).rev().map(message).collect();
        let page = page_from_newest_first(newest_first.clone(), 3);

        assert_eq!(page.messages.len(), 3);
        assert!(page.has_more);
        // Chronological output; the oldest returned row is the cursor.
        assert_eq!(page.messages[0].content, "message 1");
        assert_eq!(page.messages[2].content, "message 3");
        assert_eq!(page.next_cursor, Some(page.messages[0].id));
    }

    #[test]
    fn test_page_from_newest_first_exhausted() {
        let newest_first: Vec<WireMessage> = (0..2).rev().map(message).collect();
        let page = page_from_newest_first(newest_first, 3);

        assert_eq!(page.messages.len(), 2);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_page_from_empty_fetch() {
        let page = page_from_newest_first(Vec::new(), 50);
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_decode_cached_reverses_and_drops_garbage() {
        let newer = message(2);
        let older = message(1);
        let raw = vec![
            serde_json::to_string(&newer).unwrap(),
            "{not json".to_string(),
            serde_json::to_string(&older).unwrap(),
        ];
        let decoded = decode_cached(Uuid::nil(), raw);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].id, older.id);
        assert_eq!(decoded[1].id, newer.id);
    }

    #[test]
    fn test_encode_decode_preserves_order() {
        let chronological: Vec<WireMessage> = (0..5).map(message).collect();
        let payloads = encode_chronological(&chronological);
        // Payloads are pushed front-first, so the stored list is newest-first;
        // simulate that and decode back.
        let newest_first: Vec<String> = payloads.into_iter().rev().collect();
        let decoded = decode_cached(Uuid::nil(), newest_first);
        let ids: Vec<Uuid> = decoded.iter().map(|m| m.id).collect();
        let expected: Vec<Uuid> = chronological.iter().map(|m| m.id).collect();
        assert_eq!(ids, expected);
    }
}
