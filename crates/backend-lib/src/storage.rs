// ============================
// chat-backend-lib/src/storage.rs
// ============================
//! Persistence gateway: trait abstraction with an in-memory implementation.
//!
//! The gateway is pure data access. It knows nothing about live
//! connections; callers persist state here and then instruct the
//! presence registry separately.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use chat_common::{
    ChatRoom, Membership, Message, MessageId, MessageWithSender, NewUser, RoomId, RoomWithMembers,
    User, UserId, UserSummary,
};

use crate::error::AppError;

/// Trait for storage backends.
///
/// Uniqueness violations fail with [`AppError::Conflict`]; lookups on a
/// missing entity fail with [`AppError::NotFound`].
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_user(&self, new_user: NewUser) -> Result<User, AppError>;

    async fn get_user_by_email(&self, email: &str) -> Result<User, AppError>;

    async fn get_user_by_id(&self, id: UserId) -> Result<User, AppError>;

    /// Flip the durable online flag and refresh `last_seen`.
    async fn update_online_status(&self, user_id: UserId, online: bool) -> Result<(), AppError>;

    async fn list_users(&self) -> Result<Vec<UserSummary>, AppError>;

    async fn get_room(&self, room_id: RoomId) -> Result<ChatRoom, AppError>;

    /// Create a group room; the creator always becomes a member.
    async fn create_group_room(
        &self,
        name: &str,
        creator_id: UserId,
        member_ids: &[UserId],
    ) -> Result<RoomWithMembers, AppError>;

    /// Idempotent: a second call with the same pair (in either order)
    /// returns the existing room instead of creating a duplicate.
    async fn find_or_create_private_room(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<ChatRoom, AppError>;

    /// Rooms the user belongs to, enriched with members, last message
    /// and unread count.
    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomWithMembers>, AppError>;

    async fn members_of(&self, room_id: RoomId) -> Result<Vec<User>, AppError>;

    async fn add_members(&self, room_id: RoomId, user_ids: &[UserId]) -> Result<(), AppError>;

    async fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError>;

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, AppError>;

    async fn create_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessageWithSender, AppError>;

    /// Messages for a room, oldest to newest, up to `limit`.
    async fn messages_for_room(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<MessageWithSender>, AppError>;

    /// Mark unread messages in the room as read for `reader_id`.
    /// Messages authored by the reader are left untouched.
    async fn mark_read(&self, room_id: RoomId, reader_id: UserId) -> Result<(), AppError>;
}

/// In-memory implementation of the [`Storage`] trait.
///
/// One write lock guards the whole store, which makes the private-room
/// find-or-create sequence atomic against concurrent duplicate requests.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    rooms: HashMap<RoomId, ChatRoom>,
    memberships: Vec<Membership>,
    messages: Vec<Message>,
    next_user_id: UserId,
    next_room_id: RoomId,
    next_message_id: MessageId,
}

impl Inner {
    fn user(&self, id: UserId) -> Result<&User, AppError> {
        self.users
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))
    }

    fn room(&self, id: RoomId) -> Result<&ChatRoom, AppError> {
        self.rooms
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("room {id}")))
    }

    fn member_ids(&self, room_id: RoomId) -> Vec<UserId> {
        self.memberships
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.user_id)
            .collect()
    }

    fn has_member(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.memberships
            .iter()
            .any(|m| m.room_id == room_id && m.user_id == user_id)
    }

    fn insert_membership(&mut self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        if self.has_member(room_id, user_id) {
            return Err(AppError::Conflict(format!(
                "user {user_id} is already a member of room {room_id}"
            )));
        }
        self.memberships.push(Membership {
            room_id,
            user_id,
            joined_at: Utc::now(),
        });
        Ok(())
    }

    fn insert_room(&mut self, name: &str, is_private: bool, created_by: UserId) -> ChatRoom {
        self.next_room_id += 1;
        let room = ChatRoom {
            id: self.next_room_id,
            name: name.to_string(),
            is_private,
            created_by,
            created_at: Utc::now(),
        };
        self.rooms.insert(room.id, room.clone());
        room
    }

    fn enrich_room(&self, room: &ChatRoom, viewer_id: UserId) -> RoomWithMembers {
        let members = self
            .member_ids(room.id)
            .into_iter()
            .filter_map(|id| self.users.get(&id))
            .map(User::summary)
            .collect();

        let last_message = self
            .messages
            .iter()
            .filter(|m| m.room_id == room.id)
            .max_by_key(|m| m.id)
            .cloned();

        let unread_count = self
            .messages
            .iter()
            .filter(|m| m.room_id == room.id && m.sender_id != viewer_id && !m.is_read)
            .count();

        RoomWithMembers {
            room: room.clone(),
            members,
            last_message,
            unread_count,
        }
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn create_user(&self, new_user: NewUser) -> Result<User, AppError> {
        let mut inner = self.inner.write();
        if inner.users.values().any(|u| u.email == new_user.email) {
            return Err(AppError::Conflict(format!(
                "email {} is already registered",
                new_user.email
            )));
        }
        if inner.users.values().any(|u| u.username == new_user.username) {
            return Err(AppError::Conflict(format!(
                "username {} is already taken",
                new_user.username
            )));
        }
        inner.next_user_id += 1;
        let now = Utc::now();
        let user = User {
            id: inner.next_user_id,
            username: new_user.username,
            email: new_user.email,
            full_name: new_user.full_name,
            is_online: false,
            last_seen: now,
            created_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, AppError> {
        let inner = self.inner.read();
        inner
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user with email {email}")))
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<User, AppError> {
        let inner = self.inner.read();
        inner.user(id).cloned()
    }

    async fn update_online_status(&self, user_id: UserId, online: bool) -> Result<(), AppError> {
        let mut inner = self.inner.write();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
        user.is_online = online;
        user.last_seen = Utc::now();
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>, AppError> {
        let inner = self.inner.read();
        let mut users: Vec<UserSummary> = inner.users.values().map(User::summary).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn get_room(&self, room_id: RoomId) -> Result<ChatRoom, AppError> {
        let inner = self.inner.read();
        inner.room(room_id).cloned()
    }

    async fn create_group_room(
        &self,
        name: &str,
        creator_id: UserId,
        member_ids: &[UserId],
    ) -> Result<RoomWithMembers, AppError> {
        let mut inner = self.inner.write();
        inner.user(creator_id)?;
        for id in member_ids {
            inner.user(*id)?;
        }
        let room = inner.insert_room(name, false, creator_id);
        inner.insert_membership(room.id, creator_id)?;
        for id in member_ids {
            if *id != creator_id {
                inner.insert_membership(room.id, *id)?;
            }
        }
        Ok(inner.enrich_room(&room, creator_id))
    }

    async fn find_or_create_private_room(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<ChatRoom, AppError> {
        // one write lock across check and create closes the
        // check-then-create race for this backend
        let mut inner = self.inner.write();
        inner.user(a)?;
        let other = inner.user(b)?.clone();

        for membership in inner.memberships.iter().filter(|m| m.user_id == a) {
            let Some(room) = inner.rooms.get(&membership.room_id) else {
                continue;
            };
            if !room.is_private {
                continue;
            }
            let members = inner.member_ids(room.id);
            if members.len() == 2 && members.contains(&b) {
                return Ok(room.clone());
            }
        }

        let room = inner.insert_room(&format!("Private chat with {}", other.full_name), true, a);
        inner.insert_membership(room.id, a)?;
        inner.insert_membership(room.id, b)?;
        Ok(room)
    }

    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomWithMembers>, AppError> {
        let inner = self.inner.read();
        inner.user(user_id)?;
        let mut room_ids: Vec<RoomId> = inner
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.room_id)
            .collect();
        room_ids.sort_unstable();
        Ok(room_ids
            .into_iter()
            .filter_map(|id| inner.rooms.get(&id))
            .map(|room| inner.enrich_room(room, user_id))
            .collect())
    }

    async fn members_of(&self, room_id: RoomId) -> Result<Vec<User>, AppError> {
        let inner = self.inner.read();
        inner.room(room_id)?;
        Ok(inner
            .member_ids(room_id)
            .into_iter()
            .filter_map(|id| inner.users.get(&id))
            .cloned()
            .collect())
    }

    async fn add_members(&self, room_id: RoomId, user_ids: &[UserId]) -> Result<(), AppError> {
        let mut inner = self.inner.write();
        inner.room(room_id)?;
        for id in user_ids {
            inner.user(*id)?;
        }
        for id in user_ids {
            inner.insert_membership(room_id, *id)?;
        }
        Ok(())
    }

    async fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        let mut inner = self.inner.write();
        inner.room(room_id)?;
        let before = inner.memberships.len();
        inner
            .memberships
            .retain(|m| !(m.room_id == room_id && m.user_id == user_id));
        if inner.memberships.len() == before {
            return Err(AppError::NotFound(format!(
                "user {user_id} is not a member of room {room_id}"
            )));
        }
        Ok(())
    }

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, AppError> {
        let inner = self.inner.read();
        Ok(inner.has_member(room_id, user_id))
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessageWithSender, AppError> {
        let mut inner = self.inner.write();
        inner.room(room_id)?;
        let sender = inner.user(sender_id)?.summary();
        inner.next_message_id += 1;
        let message = Message {
            id: inner.next_message_id,
            room_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: false,
        };
        inner.messages.push(message.clone());
        Ok(MessageWithSender { message, sender })
    }

    async fn messages_for_room(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<MessageWithSender>, AppError> {
        let inner = self.inner.read();
        inner.room(room_id)?;
        // messages are appended in id order, so a plain filter preserves
        // submission order
        let room_messages: Vec<&Message> = inner
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .collect();
        let skip = room_messages.len().saturating_sub(limit);
        Ok(room_messages
            .into_iter()
            .skip(skip)
            .map(|m| {
                let sender = inner
                    .users
                    .get(&m.sender_id)
                    .map(User::summary)
                    .unwrap_or_else(|| UserSummary {
                        id: m.sender_id,
                        username: String::new(),
                        full_name: String::new(),
                        initials: String::new(),
                        is_online: false,
                    });
                MessageWithSender {
                    message: m.clone(),
                    sender,
                }
            })
            .collect())
    }

    async fn mark_read(&self, room_id: RoomId, reader_id: UserId) -> Result<(), AppError> {
        let mut inner = self.inner.write();
        inner.room(room_id)?;
        for message in inner
            .messages
            .iter_mut()
            .filter(|m| m.room_id == room_id && m.sender_id != reader_id)
        {
            message.is_read = true;
        }
        Ok(())
    }
}
