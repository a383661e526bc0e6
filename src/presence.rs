//! Presence engine
//!
//! Maintains the per-user presence record in the fast store, answers
//! room-scoped snapshot queries for the router, and reaps users whose
//! heartbeats go stale. The online-users set is the serialization point for
//! online/offline transitions: removal from it is the cluster-wide commit,
//! and only the caller that observed the removal may emit
//! `user_disconnected` events. Two nodes racing to reap the same user
//! therefore produce at most one broadcast.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::error::Result;
use crate::protocol::{BusEnvelope, PresenceInfo, PresenceStatus, RoomUpdateKind, ServerEvent};
use crate::store::bus::EventBus;
use crate::store::db::Database;
use crate::store::kv::{KvStore, PresenceRecord};

/// Presence lifecycle over the shared stores
pub struct PresenceEngine {
    db: Database,
    kv: KvStore,
}

impl PresenceEngine {
    pub fn new(db: Database, kv: KvStore) -> Self {
        Self { db, kv }
    }

    /// Mark a user online and return their active rooms.
    ///
    /// Active rooms are always recomputed from the database rather than
    /// mutated in place, so a lost update on the presence hash self-heals on
    /// the next call. Idempotent: re-marking an online user refreshes
    /// `last_seen` and the rooms set without any event emission.
    pub async fn mark_online(&self, user: &AuthedUser) -> Result<Vec<Uuid>> {
        let rooms = self.db.active_room_ids(user.id).await?;
        let record = PresenceRecord {
            status: PresenceStatus::Online,
            last_seen: Utc::now().timestamp(),
            username: user.username.clone(),
            active_rooms: rooms.clone(),
        };
        // Set membership first: a crash between the two writes leaves a user
        // the reaper can still see and converge, never an online record the
        // reaper will skip forever.
        self.kv.add_online(user.id).await?;
        self.kv.put_presence(user.id, &record).await?;
        Ok(rooms)
    }

    /// Transition a user to offline.
    ///
    /// Returns the rooms to notify when this caller won the commit (the
    /// atomic removal from the online set), `None` when another node already
    /// reaped the user. Callers must emit `user_disconnected` only on `Some`.
    pub async fn mark_offline(&self, user_id: Uuid) -> Result<Option<Vec<Uuid>>> {
        let previous = self.kv.get_presence(user_id).await?;
        let (username, rooms) = match previous {
            Some(record) => (record.username, record.active_rooms),
            None => {
                // Presence record missing for a tracked user: degrade to the
                // durable membership list instead of failing the transition.
                warn!(user_id = %user_id, "presence record missing on offline transition");
                let rooms = self.db.active_room_ids(user_id).await?;
                let username = self
                    .db
                    .user_by_id(user_id)
                    .await?
                    .map(|u| u.username)
                    .unwrap_or_default();
                (username, rooms)
            }
        };

        let record = PresenceRecord {
            status: PresenceStatus::Offline,
            last_seen: Utc::now().timestamp(),
            username,
            active_rooms: rooms.clone(),
        };
        self.kv.put_presence(user_id, &record).await?;

        if self.kv.remove_online(user_id).await? {
            Ok(Some(rooms))
        } else {
            Ok(None)
        }
    }

    /// Record a heartbeat. O(1) hot path.
    pub async fn touch(&self, user_id: Uuid) -> Result<()> {
        self.kv
            .set_heartbeat(user_id, Utc::now().timestamp())
            .await
    }

    /// Heartbeat plus idle→online rehydration.
    ///
    /// Returns the rooms that should receive `user_connected` when the user
    /// was not online before; the router performs those emits.
    pub async fn bump_activity(&self, user: &AuthedUser) -> Result<Option<Vec<Uuid>>> {
        self.touch(user.id).await?;
        if let Err(e) = self.kv.refresh_session(user.id).await {
            debug!(user_id = %user.id, "session refresh failed: {}", e);
        }

        let online = matches!(
            self.kv.get_presence(user.id).await?,
            Some(PresenceRecord {
                status: PresenceStatus::Online,
                ..
            })
        );
        if online {
            return Ok(None);
        }

        let rooms = self.mark_online(user).await?;
        info!(user_id = %user.id, rooms = rooms.len(), "rehydrated idle user to online");
        Ok(Some(rooms))
    }

    /// Presence snapshot for a room.
    ///
    /// The room-members set is consulted first; when it is cold the durable
    /// membership list is used and seeded back (best-effort).
    pub async fn snapshot(&self, room_id: Uuid) -> Result<Vec<PresenceInfo>> {
        let mut member_ids = self.kv.room_members(room_id).await?;
        if member_ids.is_empty() {
            let members = self.db.active_members(room_id).await?;
            member_ids = members.iter().map(|(id, _)| *id).collect();
            if let Err(e) = self.kv.seed_room_members(room_id, &member_ids).await {
                warn!(room_id = %room_id, "failed to seed room-members set: {}", e);
            }
        }

        let mut presences = Vec::with_capacity(member_ids.len());
        for user_id in member_ids {
            match self.kv.get_presence(user_id).await? {
                Some(record) => presences.push(record.to_info(user_id)),
                None => {
                    // Never-seen-online member; report offline.
                    if let Some(user) = self.db.user_by_id(user_id).await? {
                        presences.push(PresenceInfo {
                            user_id,
                            username: user.username,
                            status: PresenceStatus::Offline,
                            last_seen: user.created_at.timestamp(),
                        });
                    }
                }
            }
        }
        Ok(presences)
    }

    /// User ids currently in the online set
    pub async fn online_user_ids(&self) -> Result<Vec<Uuid>> {
        self.kv.online_users().await
    }

    async fn heartbeat(&self, user_id: Uuid) -> Result<Option<i64>> {
        self.kv.get_heartbeat(user_id).await
    }
}

/// Whether a heartbeat is past the stale threshold. An absent key counts as
/// stale: the TTL already outlived the reap interval.
fn is_stale(now: i64, heartbeat: Option<i64>, threshold: Duration) -> bool {
    match heartbeat {
        None => true,
        Some(ts) => now.saturating_sub(ts) > threshold.as_secs() as i64,
    }
}

/// One reaper pass: demote every online user with a stale heartbeat and
/// broadcast `user_disconnected` for transitions this node committed.
/// Returns the number of users reaped. Per-user failures are logged and do
/// not abort the pass.
pub async fn reap_once(
    engine: &PresenceEngine,
    bus: &EventBus,
    stale_threshold: Duration,
) -> Result<usize> {
    let now = Utc::now().timestamp();
    let online = engine.online_user_ids().await?;
    let mut reaped = 0;

    for user_id in online {
        let heartbeat = match engine.heartbeat(user_id).await {
            Ok(hb) => hb,
            Err(e) => {
                warn!(user_id = %user_id, "heartbeat read failed: {}", e);
                continue;
            }
        };
        if !is_stale(now, heartbeat, stale_threshold) {
            continue;
        }

        match engine.mark_offline(user_id).await {
            Ok(Some(rooms)) => {
                reaped += 1;
                info!(user_id = %user_id, rooms = rooms.len(), "reaped stale user");
                for room_id in rooms {
                    let presences = match engine.snapshot(room_id).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(room_id = %room_id, "snapshot failed during reap: {}", e);
                            continue;
                        }
                    };
                    let envelope = BusEnvelope {
                        room_id,
                        exclude: None,
                        event: ServerEvent::presence_change(
                            RoomUpdateKind::UserDisconnected,
                            room_id,
                            presences,
                        ),
                    };
                    if let Err(e) = bus.publish(&envelope).await {
                        warn!(room_id = %room_id, "user_disconnected emit failed: {}", e);
                    }
                }
            }
            Ok(None) => {
                // Another node committed this transition first.
                debug!(user_id = %user_id, "offline transition already committed elsewhere");
            }
            Err(e) => {
                warn!(user_id = %user_id, "mark_offline failed during reap: {}", e);
            }
        }
    }

    Ok(reaped)
}

/// Spawn the node's reaper task. One per node; aborted on shutdown.
pub fn spawn_reaper(
    engine: Arc<PresenceEngine>,
    bus: EventBus,
    reap_interval: Duration,
    stale_threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_interval);
        // The first tick fires immediately; skip it so a rolling restart
        // does not reap users whose heartbeats are still in flight.
        interval.tick().await;

        loop {
            interval.tick().await;
            match reap_once(&engine, &bus, stale_threshold).await {
                Ok(0) => {}
                Ok(n) => debug!("reaper pass demoted {} users", n),
                Err(e) => error!("reaper pass failed, will retry next tick: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_heartbeat_is_stale() {
        assert!(is_stale(1_000, None, Duration::from_secs(180)));
    }

    #[test]
    fn test_fresh_heartbeat_is_not_stale() {
        assert!(!is_stale(1_000, Some(990), Duration::from_secs(180)));
        assert!(!is_stale(1_000, Some(1_000 - 180), Duration::from_secs(180)));
    }

    #[test]
    fn test_old_heartbeat_is_stale() {
        assert!(is_stale(1_000, Some(1_000 - 181), Duration::from_secs(180)));
    }

    #[test]
    fn test_clock_skew_does_not_underflow() {
        // Heartbeat from the "future" (another node's clock runs ahead).
        assert!(!is_stale(1_000, Some(1_010), Duration::from_secs(180)));
    }
}
