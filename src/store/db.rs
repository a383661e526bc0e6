//! Durable store adapter
//!
//! Parameterized reads/writes for users, rooms, memberships, and the message
//! log. Message ordering is `(created_at, id)`: timestamps come from the
//! database's `now()` and are only non-decreasing, so every cursor comparison
//! uses the pair to keep pagination exact under ties.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::protocol::{MessageKind, RoomSummary, WireMessage};

/// A persisted user
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted room
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoomRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub passcode_hash: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl RoomRow {
    pub fn to_summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            is_private: self.is_private,
            created_by: self.created_by,
            created_at: self.created_at,
        }
    }
}

/// A message row joined with its author's username
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id,
            room_id: self.room_id,
            user_id: self.user_id,
            username: self.username.clone(),
            content: self.content.clone(),
            // Unknown kinds degrade to text instead of failing the read.
            kind: MessageKind::parse(&self.message_type).unwrap_or(MessageKind::Text),
            created_at: self.created_at,
        }
    }
}

/// Durable store handle. Cheap to clone; wraps a bounded connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect with a bounded pool
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Close the pool (shutdown path)
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- users ----

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRow> {
        let result = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) \
             RETURNING id, username, email, password_hash, created_at",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await;

        result.map_err(|e| match unique_violation(&e) {
            Some(constraint) if constraint.contains("email") => {
                ChatError::validation("email already registered")
            }
            Some(_) => ChatError::validation("username already taken"),
            None => e.into(),
        })
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn user_by_id(&self, user_id: Uuid) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ---- rooms ----

    pub async fn create_room(
        &self,
        name: &str,
        description: &str,
        is_private: bool,
        passcode_hash: Option<&str>,
        created_by: Uuid,
    ) -> Result<RoomRow> {
        let result = sqlx::query_as::<_, RoomRow>(
            "INSERT INTO rooms (name, description, is_private, passcode_hash, created_by) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, name, description, is_private, passcode_hash, created_by, created_at",
        )
        .bind(name)
        .bind(description)
        .bind(is_private)
        .bind(passcode_hash)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await;

        result.map_err(|e| match unique_violation(&e) {
            Some(_) => ChatError::duplicate_room_name(format!("room name taken: {}", name)),
            None => e.into(),
        })
    }

    pub async fn room_by_id(&self, room_id: Uuid) -> Result<Option<RoomRow>> {
        let row = sqlx::query_as::<_, RoomRow>(
            "SELECT id, name, description, is_private, passcode_hash, created_by, created_at \
             FROM rooms WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn public_rooms(&self) -> Result<Vec<RoomRow>> {
        let rows = sqlx::query_as::<_, RoomRow>(
            "SELECT id, name, description, is_private, passcode_hash, created_by, created_at \
             FROM rooms WHERE NOT is_private ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn rooms_for_user(&self, user_id: Uuid) -> Result<Vec<RoomRow>> {
        let rows = sqlx::query_as::<_, RoomRow>(
            "SELECT r.id, r.name, r.description, r.is_private, r.passcode_hash, r.created_by, r.created_at \
             FROM rooms r \
             JOIN room_memberships m ON m.room_id = r.id \
             WHERE m.user_id = $1 AND m.is_active \
             ORDER BY m.joined_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- memberships ----

    /// Create or reactivate a membership. Returns true when the user was not
    /// an active member before the call.
    pub async fn activate_membership(&self, user_id: Uuid, room_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO room_memberships (user_id, room_id, joined_at, is_active) \
             VALUES ($1, $2, now(), TRUE) \
             ON CONFLICT (user_id, room_id) DO UPDATE \
             SET is_active = TRUE, joined_at = now() \
             WHERE room_memberships.is_active = FALSE",
        )
        .bind(user_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete a membership. Returns true when the user was an active member.
    pub async fn deactivate_membership(&self, user_id: Uuid, room_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE room_memberships SET is_active = FALSE \
             WHERE user_id = $1 AND room_id = $2 AND is_active",
        )
        .bind(user_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_active_member(&self, user_id: Uuid, room_id: Uuid) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT TRUE FROM room_memberships \
             WHERE user_id = $1 AND room_id = $2 AND is_active",
        )
        .bind(user_id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Room ids the user is currently an active member of
    pub async fn active_room_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT room_id FROM room_memberships \
             WHERE user_id = $1 AND is_active ORDER BY joined_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Active members of a room with their usernames
    pub async fn active_members(&self, room_id: Uuid) -> Result<Vec<(Uuid, String)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT u.id, u.username FROM room_memberships m \
             JOIN users u ON u.id = m.user_id \
             WHERE m.room_id = $1 AND m.is_active",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- messages ----

    /// Append a message; the database assigns id and timestamp. This is the
    /// commit point of the write pipeline.
    pub async fn insert_message(
        &self,
        room_id: Uuid,
        user_id: Option<Uuid>,
        content: &str,
        kind: MessageKind,
    ) -> Result<(Uuid, DateTime<Utc>)> {
        let (id, created_at): (Uuid, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO messages (room_id, user_id, content, message_type) \
             VALUES ($1, $2, $3, $4) RETURNING id, created_at",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(content)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok((id, created_at))
    }

    /// Newest `limit` messages of a room, newest first
    pub async fn newest_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT m.id, m.room_id, m.user_id, u.username, m.content, m.message_type, m.created_at \
             FROM messages m LEFT JOIN users u ON u.id = m.user_id \
             WHERE m.room_id = $1 \
             ORDER BY m.created_at DESC, m.id DESC LIMIT $2",
        )
        .bind(room_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Up to `limit` messages strictly older than the `(created_at, id)`
    /// boundary, newest first
    pub async fn messages_before(
        &self,
        room_id: Uuid,
        before_created_at: DateTime<Utc>,
        before_id: Uuid,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT m.id, m.room_id, m.user_id, u.username, m.content, m.message_type, m.created_at \
             FROM messages m LEFT JOIN users u ON u.id = m.user_id \
             WHERE m.room_id = $1 AND (m.created_at, m.id) < ($2, $3) \
             ORDER BY m.created_at DESC, m.id DESC LIMIT $4",
        )
        .bind(room_id)
        .bind(before_created_at)
        .bind(before_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Resolve a cursor id to its ordering key, scoped to the room
    pub async fn message_cursor(
        &self,
        room_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<(DateTime<Utc>, Uuid)>> {
        let row: Option<(DateTime<Utc>, Uuid)> = sqlx::query_as(
            "SELECT created_at, id FROM messages WHERE id = $1 AND room_id = $2",
        )
        .bind(message_id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Whether any message is strictly older than the boundary
    pub async fn has_older(
        &self,
        room_id: Uuid,
        created_at: DateTime<Utc>,
        id: Uuid,
    ) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT TRUE FROM messages \
             WHERE room_id = $1 AND (created_at, id) < ($2, $3) LIMIT 1",
        )
        .bind(room_id)
        .bind(created_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

/// Extract the constraint name when the error is a unique violation
fn unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            Some(db_err.constraint().unwrap_or("unique").to_string())
        }
        _ => None,
    }
}
