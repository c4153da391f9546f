// ================
// common/src/lib.rs
// ================
//! Common types shared between the chat server components and clients.
//! This module defines the WebSocket protocol frames and the durable
//! entities they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a durable user record.
pub type UserId = i64;
/// Identifier for a chat room.
pub type RoomId = i64;
/// Identifier for a persisted message.
pub type MessageId = i64;

/// Frames sent from client to server over the WebSocket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Bind this connection to a known user id. The credential check
    /// happened earlier at the excluded auth boundary; the core trusts
    /// the resolved id.
    Auth { user_id: UserId },
    /// Persist a message and fan it out to the room's members.
    SendMessage { room_id: RoomId, content: String },
    /// Transient typing indicator for a room.
    Typing { room_id: RoomId, is_typing: bool },
}

/// Events sent from server to client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A user's online/offline state changed.
    Presence { user_id: UserId, online: bool },
    /// A new message was persisted in a room the recipient belongs to.
    NewMessage { message: MessageWithSender },
    /// Another member of a shared room started or stopped typing.
    Typing {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    /// A frame from this connection was rejected.
    Error { message: String },
}

/// A registered user. The password credential lives entirely in the
/// external auth collaborator and never appears here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Up to two upper-cased initials derived from the display name.
    pub fn initials(&self) -> String {
        self.full_name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .flat_map(char::to_uppercase)
            .take(2)
            .collect()
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            full_name: self.full_name.clone(),
            initials: self.initials(),
            is_online: self.is_online,
        }
    }
}

/// Input for user creation. Credentials are handled by the excluded
/// auth collaborator before this ever reaches the core.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
}

/// The resolved sender shape attached to outbound messages and member
/// listings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    pub initials: String,
    pub is_online: bool,
}

/// A messaging context: either a two-person private chat or a named group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: RoomId,
    pub name: String,
    pub is_private: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Authorization relation granting a user access to a room.
/// Unique per (room, user) pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

/// A persisted message. `room_id` and `sender_id` are immutable after
/// creation; only `is_read` changes later.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// A message with its sender resolved, as delivered to clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageWithSender {
    #[serde(flatten)]
    pub message: Message,
    pub sender: UserSummary,
}

/// A room enriched with its member list, last message and unread count,
/// as returned from the room listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomWithMembers {
    #[serde(flatten)]
    pub room: ChatRoom,
    pub members: Vec<UserSummary>,
    pub last_message: Option<Message>,
    pub unread_count: usize,
}
