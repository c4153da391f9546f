// ============================
// chat-backend-lib/src/rooms.rs
// ============================
//! Room membership resolver.
//!
//! Read-through authorization checkpoint in front of the persistence
//! gateway: every room-scoped read, write or broadcast goes through
//! [`RoomDirectory::is_member`] / [`RoomDirectory::members_of`]. Also
//! owns the room-lifecycle policy: private rooms keep their two members
//! for life, and only a group's creator mutates its membership.

use chat_common::{ChatRoom, RoomId, RoomWithMembers, User, UserId};

use crate::error::AppError;
use crate::storage::Storage;

#[derive(Clone)]
pub struct RoomDirectory<S> {
    storage: S,
}

impl<S: Storage> RoomDirectory<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, AppError> {
        self.storage.is_member(user_id, room_id).await
    }

    pub async fn members_of(&self, room_id: RoomId) -> Result<Vec<User>, AppError> {
        self.storage.members_of(room_id).await
    }

    /// Find the canonical private room between two users, creating it
    /// if they never had contact. Idempotent in either argument order.
    pub async fn open_private_room(
        &self,
        user_id: UserId,
        other_id: UserId,
    ) -> Result<ChatRoom, AppError> {
        if user_id == other_id {
            return Err(AppError::InvalidArgument(
                "cannot open a private room with yourself".to_string(),
            ));
        }
        self.storage.find_or_create_private_room(user_id, other_id).await
    }

    pub async fn create_group(
        &self,
        name: &str,
        creator_id: UserId,
        member_ids: &[UserId],
    ) -> Result<RoomWithMembers, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidArgument(
                "group name must not be empty".to_string(),
            ));
        }
        self.storage.create_group_room(name, creator_id, member_ids).await
    }

    pub async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomWithMembers>, AppError> {
        self.storage.rooms_for_user(user_id).await
    }

    /// Add members to a group room. Only the creator may do this, and
    /// never to a private room.
    pub async fn add_members(
        &self,
        room_id: RoomId,
        actor_id: UserId,
        user_ids: &[UserId],
    ) -> Result<(), AppError> {
        self.writable_room(room_id, actor_id).await?;
        self.storage.add_members(room_id, user_ids).await
    }

    /// Remove a member from a group room. Creator-only; the creator
    /// themselves cannot be removed.
    pub async fn remove_member(
        &self,
        room_id: RoomId,
        actor_id: UserId,
        user_id: UserId,
    ) -> Result<(), AppError> {
        let room = self.writable_room(room_id, actor_id).await?;
        if user_id == room.created_by {
            return Err(AppError::Forbidden(
                "the group creator cannot be removed".to_string(),
            ));
        }
        self.storage.remove_member(room_id, user_id).await
    }

    async fn writable_room(&self, room_id: RoomId, actor_id: UserId) -> Result<ChatRoom, AppError> {
        let room = self.storage.get_room(room_id).await?;
        if room.is_private {
            return Err(AppError::Forbidden(
                "private room membership is fixed".to_string(),
            ));
        }
        if room.created_by != actor_id {
            return Err(AppError::Forbidden(
                "only the group creator may change membership".to_string(),
            ));
        }
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use chat_common::NewUser;

    async fn setup(names: &[&str]) -> (RoomDirectory<MemStorage>, MemStorage, Vec<User>) {
        let storage = MemStorage::default();
        let mut users = Vec::new();
        for name in names {
            users.push(
                storage
                    .create_user(NewUser {
                        username: name.to_string(),
                        email: format!("{name}@example.com"),
                        full_name: format!("{name} Example"),
                    })
                    .await
                    .unwrap(),
            );
        }
        (RoomDirectory::new(storage.clone()), storage, users)
    }

    #[tokio::test]
    async fn test_open_private_room_rejects_self() {
        let (rooms, _storage, users) = setup(&["ada"]).await;
        let err = rooms
            .open_private_room(users[0].id, users[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_open_private_room_twice_returns_same_room() {
        let (rooms, _storage, users) = setup(&["ada", "grace"]).await;
        let first = rooms.open_private_room(users[0].id, users[1].id).await.unwrap();
        let second = rooms.open_private_room(users[1].id, users[0].id).await.unwrap();
        assert_eq!(first.id, second.id);

        let members = rooms.members_of(first.id).await.unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_create_group_requires_name() {
        let (rooms, _storage, users) = setup(&["ada", "grace"]).await;
        let err = rooms
            .create_group("   ", users[0].id, &[users[1].id])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_only_creator_mutates_group_membership() {
        let (rooms, _storage, users) = setup(&["ada", "grace", "alan"]).await;
        let group = rooms
            .create_group("team", users[0].id, &[users[1].id])
            .await
            .unwrap();

        let err = rooms
            .add_members(group.room.id, users[1].id, &[users[2].id])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        rooms
            .add_members(group.room.id, users[0].id, &[users[2].id])
            .await
            .unwrap();
        assert!(rooms.is_member(users[2].id, group.room.id).await.unwrap());

        rooms
            .remove_member(group.room.id, users[0].id, users[2].id)
            .await
            .unwrap();
        assert!(!rooms.is_member(users[2].id, group.room.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_private_room_membership_is_fixed() {
        let (rooms, _storage, users) = setup(&["ada", "grace", "alan"]).await;
        let room = rooms.open_private_room(users[0].id, users[1].id).await.unwrap();

        let err = rooms
            .add_members(room.id, users[0].id, &[users[2].id])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = rooms
            .remove_member(room.id, users[0].id, users[1].id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_creator_cannot_be_removed() {
        let (rooms, _storage, users) = setup(&["ada", "grace"]).await;
        let group = rooms
            .create_group("team", users[0].id, &[users[1].id])
            .await
            .unwrap();

        let err = rooms
            .remove_member(group.room.id, users[0].id, users[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
