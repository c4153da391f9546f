// ============================
// chat-backend-lib/src/rest.rs
// ============================
//! REST boundary over the same services the WebSocket uses.
//!
//! The authenticated user id is resolved by the external auth
//! collaborator and handed to the core in the `x-user-id` header; the
//! core trusts it and does not re-verify credentials.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::request::Parts,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use chat_common::{
    ChatRoom, MessageWithSender, RoomId, RoomWithMembers, UserId, UserSummary,
};

use crate::error::AppError;
use crate::storage::Storage;
use crate::AppState;

/// The externally-resolved authenticated user id.
pub struct AuthUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .map(AuthUser)
            .ok_or_else(|| {
                AppError::Unauthorized("missing or invalid x-user-id header".to_string())
            })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    pub member_ids: Vec<UserId>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Create the REST router
pub fn create_router<S: Storage + Clone + Send + Sync + 'static>(
    state: Arc<AppState<S>>,
) -> Router {
    Router::new()
        .route("/api/users", get(list_users::<S>))
        .route("/api/chats", get(list_rooms::<S>))
        .route("/api/chats/{user_id}", post(open_private_room::<S>))
        .route("/api/groups", post(create_group::<S>))
        .route("/api/chats/{room_id}/messages", get(room_messages::<S>))
        .with_state(state)
}

/// All users except the caller.
async fn list_users<S: Storage + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<UserSummary>>, AppError> {
    let users = state.storage.list_users().await?;
    Ok(Json(users.into_iter().filter(|u| u.id != user_id).collect()))
}

async fn list_rooms<S: Storage + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<RoomWithMembers>>, AppError> {
    let rooms = state.rooms().rooms_for_user(user_id).await?;
    Ok(Json(rooms))
}

/// Idempotent: repeated calls for the same pair return the same room.
async fn open_private_room<S: Storage + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    AuthUser(user_id): AuthUser,
    Path(other_id): Path<UserId>,
) -> Result<Json<ChatRoom>, AppError> {
    let room = state.rooms().open_private_room(user_id, other_id).await?;
    Ok(Json(room))
}

async fn create_group<S: Storage + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Json<RoomWithMembers>, AppError> {
    let room = state
        .rooms()
        .create_group(&request.name, user_id, &request.member_ids)
        .await?;
    Ok(Json(room))
}

/// Room history; fetching it records read receipts for the caller.
async fn room_messages<S: Storage + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    AuthUser(user_id): AuthUser,
    Path(room_id): Path<RoomId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageWithSender>>, AppError> {
    let messages = state.pipeline().history(room_id, user_id, query.limit).await?;
    Ok(Json(messages))
}
