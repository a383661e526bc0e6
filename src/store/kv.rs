//! Fast-store adapter
//!
//! Typed access to the shared Redis instance: the recent-message list per
//! room, the room-members and online-users sets, presence hashes, and the
//! short-TTL heartbeat/session keys. One multiplexed connection per node;
//! the pub/sub subscriber lives in [`crate::store::bus`] on its own
//! connection.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{PresenceInfo, PresenceStatus};

/// Key naming, kept in one place so every node agrees
pub mod keys {
    use uuid::Uuid;

    pub const ONLINE_USERS: &str = "online_users";

    pub fn recent(room_id: Uuid) -> String {
        format!("recent:{}", room_id)
    }

    pub fn room_members(room_id: Uuid) -> String {
        format!("room_members:{}", room_id)
    }

    pub fn presence(user_id: Uuid) -> String {
        format!("presence:{}", user_id)
    }

    pub fn heartbeat(user_id: Uuid) -> String {
        format!("heartbeat:{}", user_id)
    }

    pub fn session(user_id: Uuid) -> String {
        format!("session:{}", user_id)
    }
}

/// Per-user presence record stored as a hash
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub last_seen: i64,
    pub username: String,
    pub active_rooms: Vec<Uuid>,
}

impl PresenceRecord {
    /// Hash fields for HSET
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.status.as_str().to_string()),
            ("last_seen", self.last_seen.to_string()),
            ("username", self.username.clone()),
            (
                "active_rooms",
                serde_json::to_string(&self.active_rooms).unwrap_or_else(|_| "[]".to_string()),
            ),
        ]
    }

    /// Rebuild from HGETALL output; None when the hash is absent or mangled
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        let status = PresenceStatus::parse(map.get("status")?)?;
        let last_seen = map.get("last_seen")?.parse().ok()?;
        let username = map.get("username")?.clone();
        let active_rooms = map
            .get("active_rooms")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Some(Self {
            status,
            last_seen,
            username,
            active_rooms,
        })
    }

    pub fn to_info(&self, user_id: Uuid) -> PresenceInfo {
        PresenceInfo {
            user_id,
            username: self.username.clone(),
            status: self.status,
            last_seen: self.last_seen,
        }
    }
}

/// Fast-store handle. Cheap to clone.
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
    cache_size: usize,
    cache_ttl: Duration,
    heartbeat_ttl: Duration,
    session_ttl: Duration,
}

impl KvStore {
    pub async fn connect(
        url: &str,
        cache_size: usize,
        cache_ttl: Duration,
        heartbeat_ttl: Duration,
        session_ttl: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            cache_size,
            cache_ttl,
            heartbeat_ttl,
            session_ttl,
        })
    }

    // ---- recent-message list ----

    /// Push one serialized message to the front of a room's recent list.
    /// The push, trim, and TTL refresh run as one pipeline so the list never
    /// exceeds the configured bound.
    pub async fn recent_push(&self, room_id: Uuid, payload: &str) -> Result<()> {
        let key = keys::recent(room_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(&key, payload)
            .ltrim(&key, 0, self.cache_size as isize - 1)
            .expire(&key, self.cache_ttl.as_secs() as i64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Atomically rebuild a room's recent list from messages in chronological
    /// order. DEL + LPUSH in one transaction means concurrent seeders settle
    /// on one complete snapshot instead of interleaving duplicates.
    pub async fn recent_seed(&self, room_id: Uuid, chronological: &[String]) -> Result<()> {
        if chronological.is_empty() {
            return Ok(());
        }
        let key = keys::recent(room_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(&key)
            .lpush(&key, chronological)
            .ltrim(&key, 0, self.cache_size as isize - 1)
            .expire(&key, self.cache_ttl.as_secs() as i64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Newest-first slice of a room's recent list
    pub async fn recent_range(&self, room_id: Uuid, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn
            .lrange(keys::recent(room_id), 0, count as isize - 1)
            .await?;
        Ok(items)
    }

    /// Entire recent list, newest first
    pub async fn recent_all(&self, room_id: Uuid) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(keys::recent(room_id), 0, -1).await?;
        Ok(items)
    }

    pub async fn recent_len(&self, room_id: Uuid) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(keys::recent(room_id)).await?;
        Ok(len.max(0) as usize)
    }

    pub async fn recent_exists(&self, room_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(keys::recent(room_id)).await?)
    }

    pub async fn recent_delete(&self, room_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::recent(room_id)).await?;
        Ok(())
    }

    // ---- sets ----

    pub async fn add_room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(keys::room_members(room_id), user_id.to_string())
            .await?;
        Ok(())
    }

    pub async fn remove_room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(keys::room_members(room_id), user_id.to_string())
            .await?;
        Ok(())
    }

    pub async fn room_members(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(keys::room_members(room_id)).await?;
        Ok(parse_ids(members))
    }

    pub async fn is_room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn
            .sismember(keys::room_members(room_id), user_id.to_string())
            .await?)
    }

    pub async fn seed_room_members(&self, room_id: Uuid, user_ids: &[Uuid]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = user_ids.iter().map(|id| id.to_string()).collect();
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(keys::room_members(room_id), members)
            .await?;
        Ok(())
    }

    pub async fn add_online(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(keys::ONLINE_USERS, user_id.to_string())
            .await?;
        Ok(())
    }

    /// Remove a user from the online set. The `true` return is the cluster-wide
    /// commit for an offline transition: exactly one caller observes it.
    pub async fn remove_online(&self, user_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(keys::ONLINE_USERS, user_id.to_string()).await?;
        Ok(removed > 0)
    }

    pub async fn online_users(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(keys::ONLINE_USERS).await?;
        Ok(parse_ids(members))
    }

    // ---- presence hash ----

    pub async fn put_presence(&self, user_id: Uuid, record: &PresenceRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(keys::presence(user_id), &record.to_fields())
            .await?;
        Ok(())
    }

    pub async fn get_presence(&self, user_id: Uuid) -> Result<Option<PresenceRecord>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(keys::presence(user_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(PresenceRecord::from_map(&map))
    }

    // ---- TTL keys ----

    pub async fn set_heartbeat(&self, user_id: Uuid, timestamp: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            keys::heartbeat(user_id),
            timestamp,
            self.heartbeat_ttl.as_secs(),
        )
        .await?;
        Ok(())
    }

    pub async fn get_heartbeat(&self, user_id: Uuid) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::heartbeat(user_id)).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    pub async fn set_session(&self, user_id: Uuid, connection_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            keys::session(user_id),
            connection_id.to_string(),
            self.session_ttl.as_secs(),
        )
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::session(user_id)).await?;
        Ok(raw.and_then(|v| Uuid::parse_str(&v).ok()))
    }

    pub async fn refresh_session(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(keys::session(user_id), self.session_ttl.as_secs() as i64)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::session(user_id)).await?;
        Ok(())
    }
}

fn parse_ids(raw: Vec<String>) -> Vec<Uuid> {
    raw.into_iter()
        .filter_map(|s| match Uuid::parse_str(&s) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("dropping malformed id in kv set: {}", s);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        let id = Uuid::nil();
        assert_eq!(
            keys::recent(id),
            "recent:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            keys::heartbeat(id),
            "heartbeat:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys::ONLINE_USERS, "online_users");
    }

    #[test]
    fn test_presence_record_round_trip() {
        let record = PresenceRecord {
            status: PresenceStatus::Online,
            last_seen: 1_720_000_000,
            username: "alice".to_string(),
            active_rooms: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        let map: HashMap<String, String> = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = PresenceRecord::from_map(&map).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_presence_record_rejects_partial_hash() {
        let mut map = HashMap::new();
        map.insert("status".to_string(), "online".to_string());
        assert!(PresenceRecord::from_map(&map).is_none());
    }

    #[test]
    fn test_parse_ids_drops_garbage() {
        let good = Uuid::new_v4();
        let ids = parse_ids(vec![good.to_string(), "nope".to_string()]);
        assert_eq!(ids, vec![good]);
    }
}
