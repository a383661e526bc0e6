//! Room listing and CRUD

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::error::Result;
use crate::protocol::RoomSummary;
use crate::server::socket_server::AppState;

#[derive(Debug, Serialize)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
    pub passcode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub room: RoomSummary,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomRequest {
    pub room_id: Uuid,
    pub passcode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinRoomResponse {
    pub room: RoomSummary,
    pub newly_joined: bool,
}

#[derive(Debug, Serialize)]
pub struct LeaveRoomResponse {
    pub left: bool,
}

pub async fn public_rooms(State(state): State<AppState>) -> Result<Json<RoomsResponse>> {
    let rooms = state.db.public_rooms().await?;
    Ok(Json(RoomsResponse {
        rooms: rooms.iter().map(|r| r.to_summary()).collect(),
    }))
}

pub async fn my_rooms(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<RoomsResponse>> {
    let rooms = state.db.rooms_for_user(user.id).await?;
    Ok(Json(RoomsResponse {
        rooms: rooms.iter().map(|r| r.to_summary()).collect(),
    }))
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<RoomResponse>> {
    let room = state
        .rooms
        .create(
            &user,
            &req.name,
            &req.description,
            req.is_private,
            req.passcode.as_deref(),
        )
        .await?;
    Ok(Json(RoomResponse {
        room: room.to_summary(),
    }))
}

pub async fn join(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<JoinRoomRequest>,
) -> Result<Json<JoinRoomResponse>> {
    let outcome = state
        .rooms
        .join(&user, req.room_id, req.passcode.as_deref())
        .await?;
    Ok(Json(JoinRoomResponse {
        room: outcome.room.to_summary(),
        newly_joined: outcome.newly_joined,
    }))
}

pub async fn leave(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(room_id): Path<Uuid>,
) -> Result<Json<LeaveRoomResponse>> {
    let left = state.rooms.leave(&user, room_id).await?;
    Ok(Json(LeaveRoomResponse { left }))
}
