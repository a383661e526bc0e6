//! Room membership service
//!
//! Create/join/leave live here so the REST surface and the socket router
//! share one code path: passcode checks, the membership toggle, the
//! room-members set, the system announcement message, and the
//! `user_joined`/`user_left` broadcasts all behave identically no matter
//! which side initiated the change.

use std::sync::Arc;

use tracing::{error, warn};
use uuid::Uuid;

use crate::auth::{hash_secret, verify_secret, AuthedUser};
use crate::error::{ChatError, Result};
use crate::pipeline::MessagePipeline;
use crate::presence::PresenceEngine;
use crate::protocol::{BusEnvelope, MessageKind, RoomUpdateKind, ServerEvent};
use crate::store::bus::EventBus;
use crate::store::db::{Database, RoomRow};
use crate::store::kv::KvStore;

const MAX_ROOM_NAME_LEN: usize = 64;
const MAX_DESCRIPTION_LEN: usize = 500;

/// Result of a join request
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: RoomRow,
    /// True when the user was not an active member before this call
    pub newly_joined: bool,
}

/// Membership orchestration over the shared stores
pub struct RoomService {
    db: Database,
    kv: KvStore,
    bus: EventBus,
    pipeline: MessagePipeline,
    presence: Arc<PresenceEngine>,
    purge_cache_on_leave: bool,
}

impl RoomService {
    pub fn new(
        db: Database,
        kv: KvStore,
        bus: EventBus,
        pipeline: MessagePipeline,
        presence: Arc<PresenceEngine>,
        purge_cache_on_leave: bool,
    ) -> Self {
        Self {
            db,
            kv,
            bus,
            pipeline,
            presence,
            purge_cache_on_leave,
        }
    }

    /// Create a room; the creator becomes its first active member.
    pub async fn create(
        &self,
        user: &AuthedUser,
        name: &str,
        description: &str,
        is_private: bool,
        passcode: Option<&str>,
    ) -> Result<RoomRow> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(ChatError::validation(format!(
                "room name must be 1-{} characters",
                MAX_ROOM_NAME_LEN
            )));
        }
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ChatError::validation(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }

        let passcode_hash = match (is_private, passcode) {
            (true, Some(code)) if !code.is_empty() => Some(hash_secret(code)),
            (true, _) => {
                return Err(ChatError::validation("private rooms require a passcode"));
            }
            (false, _) => None,
        };

        let room = self
            .db
            .create_room(name, description, is_private, passcode_hash.as_deref(), user.id)
            .await?;

        self.db.activate_membership(user.id, room.id).await?;
        if let Err(e) = self.kv.add_room_member(room.id, user.id).await {
            warn!(room_id = %room.id, "room-members set update failed: {}", e);
        }

        Ok(room)
    }

    /// Join a room, checking the passcode for private rooms.
    ///
    /// Idempotent: joining a room the user is already an active member of
    /// returns `newly_joined = false` and emits nothing. A fresh join emits
    /// the system announcement (which fans out through the message pipeline)
    /// and a `user_joined` room update.
    pub async fn join(
        &self,
        user: &AuthedUser,
        room_id: Uuid,
        passcode: Option<&str>,
    ) -> Result<JoinOutcome> {
        let room = self
            .db
            .room_by_id(room_id)
            .await?
            .ok_or_else(|| ChatError::not_found("room not found"))?;

        if self.db.is_active_member(user.id, room_id).await? {
            return Ok(JoinOutcome {
                room,
                newly_joined: false,
            });
        }

        if room.is_private {
            let Some(stored) = room.passcode_hash.as_deref() else {
                // Schema constraint makes this unreachable; degrade to locked.
                error!(room_id = %room_id, "private room has no passcode hash");
                return Err(ChatError::invariant(format!(
                    "private room {} has no passcode hash",
                    room_id
                )));
            };
            match passcode {
                None => {
                    return Err(ChatError::passcode_required(
                        "this room requires a passcode",
                    ));
                }
                Some(code) if !verify_secret(code, stored) => {
                    return Err(ChatError::invalid_passcode("wrong passcode"));
                }
                Some(_) => {}
            }
        }

        let newly_joined = self.db.activate_membership(user.id, room_id).await?;
        if let Err(e) = self.kv.add_room_member(room_id, user.id).await {
            warn!(room_id = %room_id, "room-members set update failed: {}", e);
        }

        if newly_joined {
            self.announce(user, room_id, RoomUpdateKind::UserJoined, "joined the room")
                .await;
        }

        Ok(JoinOutcome { room, newly_joined })
    }

    /// Leave a room (soft delete; history is preserved). Returns whether the
    /// user was an active member. Idempotent.
    pub async fn leave(&self, user: &AuthedUser, room_id: Uuid) -> Result<bool> {
        if self.db.room_by_id(room_id).await?.is_none() {
            return Err(ChatError::not_found("room not found"));
        }

        let was_member = self.db.deactivate_membership(user.id, room_id).await?;
        if !was_member {
            return Ok(false);
        }

        if let Err(e) = self.kv.remove_room_member(room_id, user.id).await {
            warn!(room_id = %room_id, "room-members set update failed: {}", e);
        }
        if self.purge_cache_on_leave {
            if let Err(e) = self.pipeline.purge_author(room_id, user.id).await {
                warn!(room_id = %room_id, "cache purge on leave failed: {}", e);
            }
        }

        self.announce(user, room_id, RoomUpdateKind::UserLeft, "left the room")
            .await;
        Ok(true)
    }

    /// System announcement plus presence-change broadcast. Best-effort: the
    /// membership change is already committed, so failures are logged rather
    /// than unwound.
    async fn announce(&self, user: &AuthedUser, room_id: Uuid, kind: RoomUpdateKind, verb: &str) {
        let content = format!("{} {}", user.username, verb);
        if let Err(e) = self
            .pipeline
            .create_message(room_id, None, &content, MessageKind::System)
            .await
        {
            warn!(room_id = %room_id, "system message failed: {}", e);
        }

        let presences = match self.presence.snapshot(room_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(room_id = %room_id, "presence snapshot failed: {}", e);
                return;
            }
        };
        let envelope = BusEnvelope {
            room_id,
            exclude: None,
            event: ServerEvent::presence_change(kind, room_id, presences),
        };
        if let Err(e) = self.bus.publish(&envelope).await {
            warn!(room_id = %room_id, "presence broadcast failed: {}", e);
        }
    }
}
