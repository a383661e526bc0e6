//! Registration and login

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::{hash_secret, verify_secret};
use crate::error::{ChatError, Result};
use crate::server::socket_server::AppState;
use crate::store::db::UserRow;

const MIN_PASSWORD_LEN: usize = 8;
const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=32;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// User shape returned to clients; never includes the credential hash
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for PublicUser {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            email: row.email,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: PublicUser,
    pub token: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>> {
    let username = req.username.trim();
    validate_username(username)?;
    let email = req.email.trim().to_lowercase();
    validate_email(&email)?;
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ChatError::validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let password_hash = hash_secret(&req.password);
    let user = state.db.create_user(username, &email, &password_hash).await?;
    let token = state.tokens.issue(user.id)?;

    info!(user_id = %user.id, "registered user {}", user.username);
    Ok(Json(AuthResponse {
        user: user.into(),
        token,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let email = req.email.trim().to_lowercase();
    let user = state
        .db
        .user_by_email(&email)
        .await?
        .ok_or_else(|| ChatError::unauthorized("invalid credentials"))?;

    if !verify_secret(&req.password, &user.password_hash) {
        return Err(ChatError::unauthorized("invalid credentials"));
    }

    let token = state.tokens.issue(user.id)?;
    Ok(Json(AuthResponse {
        user: user.into(),
        token,
    }))
}

fn validate_username(username: &str) -> Result<()> {
    if !USERNAME_LEN.contains(&username.chars().count()) {
        return Err(ChatError::validation(format!(
            "username must be {}-{} characters",
            USERNAME_LEN.start(),
            USERNAME_LEN.end()
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ChatError::validation(
            "username may contain letters, digits, '_' and '-' only",
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(ChatError::validation("invalid email address"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("al").is_err());
        assert!(validate_username("a name").is_err());
        assert!(validate_username("ok_name-2").is_ok());
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("alice@example.com").is_ok());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("alice@nodot").is_err());
        assert!(validate_email("not-an-email").is_err());
    }
}
