//! REST surface
//!
//! Thin validators over the service layer: registration, login, and room
//! CRUD. Every failure maps onto the shared `{"error": {message, code}}`
//! body, and the bearer-token extractor hands handlers a resolved
//! [`AuthedUser`].

pub mod auth;
pub mod rooms;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::AuthedUser;
use crate::error::ChatError;
use crate::server::socket_server::{bearer_token, AppState};

/// All REST routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/rooms/public", get(rooms::public_rooms))
        .route("/rooms/my-rooms", get(rooms::my_rooms))
        .route("/rooms/create", post(rooms::create))
        .route("/rooms/join", post(rooms::join))
        .route("/rooms/{room_id}/leave", post(rooms::leave))
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::Validation(_) | ChatError::PasscodeRequired(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) | ChatError::InvalidPasscode(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::DuplicateRoomName(_) => StatusCode::CONFLICT,
            ChatError::Downstream(_) | ChatError::Timeout(_) | ChatError::Invariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "error": {
                "message": self.client_message(),
                "code": self.code(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ChatError::unauthorized("missing bearer token"))?;
        state.resolve_token(&token).await
    }
}
