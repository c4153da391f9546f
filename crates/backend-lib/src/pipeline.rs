// ============================
// chat-backend-lib/src/pipeline.rs
// ============================
//! Message pipeline: validate, persist, fan out.
//!
//! `submit` is the only place messages are created; `history` is the
//! only place read receipts are recorded. Persistence failure aborts a
//! submission before any fan-out, so live recipients never see a
//! message the store does not hold. A per-room lock held across
//! persist and fan-out keeps delivery order equal to persist order;
//! the pipeline is cloned, not rebuilt, so every connection contends
//! on the same locks.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex;

use chat_common::{MessageWithSender, RoomId, ServerEvent, UserId};

use crate::error::AppError;
use crate::metrics as metric_keys;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomDirectory;
use crate::storage::Storage;

/// Default number of messages returned by a history fetch.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct MessagePipeline<S> {
    storage: S,
    rooms: RoomDirectory<S>,
    presence: Arc<PresenceRegistry>,
    history_limit: usize,
    submit_locks: Arc<DashMap<RoomId, Arc<Mutex<()>>>>,
}

impl<S: Storage + Clone> MessagePipeline<S> {
    pub fn new(storage: S, presence: Arc<PresenceRegistry>, history_limit: usize) -> Self {
        Self {
            rooms: RoomDirectory::new(storage.clone()),
            storage,
            presence,
            history_limit,
            submit_locks: Arc::new(DashMap::new()),
        }
    }

    /// Validate, persist and distribute a new message.
    ///
    /// Every member of the room gets the `new_message` event, the sender
    /// included: clients rely on their own echo to update UI state.
    /// Members without a live connection miss the event and catch up on
    /// their next history fetch.
    pub async fn submit(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        raw_content: &str,
    ) -> Result<MessageWithSender, AppError> {
        let content = raw_content.trim();
        if content.is_empty() {
            return Err(AppError::InvalidArgument(
                "message content must not be empty".to_string(),
            ));
        }
        if !self.rooms.is_member(sender_id, room_id).await? {
            return Err(AppError::Forbidden(format!(
                "user {sender_id} is not a member of room {room_id}"
            )));
        }

        // held across persist and fan-out: a submission that suspends
        // between the two must not be overtaken by a later one
        let room_lock = self
            .submit_locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _ordering_guard = room_lock.lock().await;

        // a storage failure here is fatal to the operation: no fan-out
        let message = self.storage.create_message(room_id, sender_id, content).await?;

        let recipients = self.rooms.members_of(room_id).await?;
        let event = ServerEvent::NewMessage {
            message: message.clone(),
        };
        for recipient in &recipients {
            self.presence.send_to(recipient.id, event.clone()).await;
        }

        counter!(metric_keys::MESSAGES_SENT).increment(1);
        Ok(message)
    }

    /// Room history, oldest to newest, up to `limit` (default 50).
    ///
    /// As a side effect marks the room's unread messages as read for the
    /// requester; messages the requester authored are not touched.
    pub async fn history(
        &self,
        room_id: RoomId,
        requester_id: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithSender>, AppError> {
        if !self.rooms.is_member(requester_id, room_id).await? {
            return Err(AppError::Forbidden(format!(
                "user {requester_id} is not a member of room {room_id}"
            )));
        }
        let limit = limit.unwrap_or(self.history_limit);
        let messages = self.storage.messages_for_room(room_id, limit).await?;
        self.storage.mark_read(room_id, requester_id).await?;
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{ConnectionHandle, Outbound};
    use crate::storage::MemStorage;
    use async_trait::async_trait;
    use chat_common::{ChatRoom, NewUser, RoomWithMembers, User, UserSummary};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Notify};
    use uuid::Uuid;

    struct Harness {
        pipeline: MessagePipeline<MemStorage>,
        storage: MemStorage,
        presence: Arc<PresenceRegistry>,
        users: Vec<User>,
    }

    async fn setup(names: &[&str]) -> Harness {
        let storage = MemStorage::default();
        let presence = Arc::new(PresenceRegistry::default());
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
        Harness {
            pipeline: MessagePipeline::new(storage.clone(), presence.clone(), DEFAULT_HISTORY_LIMIT),
            storage,
            presence,
            users,
        }
    }

    fn connect(presence: &PresenceRegistry, user_id: i64) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        presence.register(user_id, ConnectionHandle::new(Uuid::new_v4(), tx));
        rx
    }

    fn expect_new_message(out: Option<Outbound>) -> MessageWithSender {
        match out {
            Some(Outbound::Event(ServerEvent::NewMessage { message })) => message,
            other => panic!("expected new_message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_whitespace_content_is_rejected_before_persistence() {
        let h = setup(&["ada", "grace"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();

        let err = h
            .pipeline
            .submit(room.id, h.users[0].id, "   \t\n  ")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let stored = h.storage.messages_for_room(room.id, 50).await.unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_non_member_submission_is_forbidden_with_no_side_effects() {
        let h = setup(&["ada", "grace", "dora"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();
        let mut rx_a = connect(&h.presence, h.users[0].id);

        let err = h
            .pipeline
            .submit(room.id, h.users[2].id, "let me in")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        assert!(h.storage.messages_for_room(room.id, 50).await.unwrap().is_empty());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submit_fans_out_to_all_members_including_sender() {
        let h = setup(&["ada", "grace", "alan"]).await;
        let group = h
            .storage
            .create_group_room("team", h.users[0].id, &[h.users[1].id, h.users[2].id])
            .await
            .unwrap();

        let mut rx_a = connect(&h.presence, h.users[0].id);
        let mut rx_b = connect(&h.presence, h.users[1].id);
        let mut rx_c = connect(&h.presence, h.users[2].id);

        let sent = h
            .pipeline
            .submit(group.room.id, h.users[0].id, "hello")
            .await
            .unwrap();
        assert_eq!(sent.message.content, "hello");
        assert_eq!(sent.sender.id, h.users[0].id);

        // everyone gets exactly one event, sender echo included
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            let message = expect_new_message(rx.recv().await);
            assert_eq!(message.message.content, "hello");
            assert_eq!(message.sender.id, h.users[0].id);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_offline_members_are_skipped_silently() {
        let h = setup(&["ada", "grace"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();
        // nobody connected: submit must still persist and succeed
        h.pipeline.submit(room.id, h.users[0].id, "hello?").await.unwrap();
        assert_eq!(h.storage.messages_for_room(room.id, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_content_is_trimmed() {
        let h = setup(&["ada", "grace"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();
        let sent = h
            .pipeline
            .submit(room.id, h.users[0].id, "  hi there  ")
            .await
            .unwrap();
        assert_eq!(sent.message.content, "hi there");
    }

    #[tokio::test]
    async fn test_history_requires_membership() {
        let h = setup(&["ada", "grace", "dora"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();
        let err = h
            .pipeline
            .history(room.id, h.users[2].id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_history_returns_submission_order_and_marks_read() {
        let h = setup(&["ada", "grace"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();

        h.pipeline.submit(room.id, h.users[1].id, "one").await.unwrap();
        h.pipeline.submit(room.id, h.users[1].id, "two").await.unwrap();
        h.pipeline.submit(room.id, h.users[0].id, "three").await.unwrap();

        let history = h.pipeline.history(room.id, h.users[0].id, None).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        // grace's messages are now read for ada; ada's own message keeps
        // its unread flag (read receipts don't apply to the author)
        let rooms = h.storage.rooms_for_user(h.users[0].id).await.unwrap();
        assert_eq!(rooms[0].unread_count, 0);
        let rooms = h.storage.rooms_for_user(h.users[1].id).await.unwrap();
        assert_eq!(rooms[0].unread_count, 1);
    }

    /// Parks the first `create_message` caller after the write lands,
    /// until the test releases it. Everything else passes through.
    #[derive(Clone)]
    struct StallingStorage {
        inner: MemStorage,
        entered: Arc<Notify>,
        release: Arc<Notify>,
        stalled: Arc<AtomicBool>,
    }

    impl StallingStorage {
        fn new(inner: MemStorage) -> Self {
            Self {
                inner,
                entered: Arc::new(Notify::new()),
                release: Arc::new(Notify::new()),
                stalled: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Storage for StallingStorage {
        async fn create_user(&self, new_user: NewUser) -> Result<User, AppError> {
            self.inner.create_user(new_user).await
        }

        async fn get_user_by_email(&self, email: &str) -> Result<User, AppError> {
            self.inner.get_user_by_email(email).await
        }

        async fn get_user_by_id(&self, id: UserId) -> Result<User, AppError> {
            self.inner.get_user_by_id(id).await
        }

        async fn update_online_status(&self, user_id: UserId, online: bool) -> Result<(), AppError> {
            self.inner.update_online_status(user_id, online).await
        }

        async fn list_users(&self) -> Result<Vec<UserSummary>, AppError> {
            self.inner.list_users().await
        }

        async fn get_room(&self, room_id: RoomId) -> Result<ChatRoom, AppError> {
            self.inner.get_room(room_id).await
        }

        async fn create_group_room(
            &self,
            name: &str,
            creator_id: UserId,
            member_ids: &[UserId],
        ) -> Result<RoomWithMembers, AppError> {
            self.inner.create_group_room(name, creator_id, member_ids).await
        }

        async fn find_or_create_private_room(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<ChatRoom, AppError> {
            self.inner.find_or_create_private_room(a, b).await
        }

        async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomWithMembers>, AppError> {
            self.inner.rooms_for_user(user_id).await
        }

        async fn members_of(&self, room_id: RoomId) -> Result<Vec<User>, AppError> {
            self.inner.members_of(room_id).await
        }

        async fn add_members(&self, room_id: RoomId, user_ids: &[UserId]) -> Result<(), AppError> {
            self.inner.add_members(room_id, user_ids).await
        }

        async fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
            self.inner.remove_member(room_id, user_id).await
        }

        async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, AppError> {
            self.inner.is_member(user_id, room_id).await
        }

        async fn create_message(
            &self,
            room_id: RoomId,
            sender_id: UserId,
            content: &str,
        ) -> Result<MessageWithSender, AppError> {
            let message = self.inner.create_message(room_id, sender_id, content).await;
            if !self.stalled.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            message
        }

        async fn messages_for_room(
            &self,
            room_id: RoomId,
            limit: usize,
        ) -> Result<Vec<MessageWithSender>, AppError> {
            self.inner.messages_for_room(room_id, limit).await
        }

        async fn mark_read(&self, room_id: RoomId, reader_id: UserId) -> Result<(), AppError> {
            self.inner.mark_read(room_id, reader_id).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_submits_deliver_in_persist_order() {
        let inner = MemStorage::default();
        let ada = inner
            .create_user(NewUser {
                username: "ada".to_string(),
                email: "ada@example.com".to_string(),
                full_name: "Ada Example".to_string(),
            })
            .await
            .unwrap();
        let grace = inner
            .create_user(NewUser {
                username: "grace".to_string(),
                email: "grace@example.com".to_string(),
                full_name: "Grace Example".to_string(),
            })
            .await
            .unwrap();
        let room = inner.find_or_create_private_room(ada.id, grace.id).await.unwrap();

        let storage = StallingStorage::new(inner.clone());
        let presence = Arc::new(PresenceRegistry::default());
        let pipeline =
            MessagePipeline::new(storage.clone(), presence.clone(), DEFAULT_HISTORY_LIMIT);
        let mut rx_g = connect(&presence, grace.id);

        // the first submission parks inside the store, after its write
        // landed but before fan-out
        let first = {
            let pipeline = pipeline.clone();
            let room_id = room.id;
            let sender = ada.id;
            tokio::spawn(async move { pipeline.submit(room_id, sender, "first").await.unwrap() })
        };
        storage.entered.notified().await;

        // a second submission races it while the first is parked
        let second = {
            let pipeline = pipeline.clone();
            let room_id = room.id;
            let sender = ada.id;
            tokio::spawn(async move { pipeline.submit(room_id, sender, "second").await.unwrap() })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        storage.release.notify_one();
        first.await.unwrap();
        second.await.unwrap();

        let delivered = [
            expect_new_message(rx_g.recv().await).message.content,
            expect_new_message(rx_g.recv().await).message.content,
        ];
        let stored: Vec<String> = inner
            .messages_for_room(room.id, 50)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message.content)
            .collect();
        assert_eq!(stored, vec!["first", "second"]);
        assert_eq!(delivered.as_slice(), stored.as_slice());
    }

    #[tokio::test]
    async fn test_history_limit_defaults_to_fifty() {
        let h = setup(&["ada", "grace"]).await;
        let room = h
            .storage
            .find_or_create_private_room(h.users[0].id, h.users[1].id)
            .await
            .unwrap();
        for i in 0..60 {
            h.pipeline
                .submit(room.id, h.users[0].id, &format!("m{i}"))
                .await
                .unwrap();
        }
        let history = h.pipeline.history(room.id, h.users[1].id, None).await.unwrap();
        assert_eq!(history.len(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().message.content, "m59");

        let short = h.pipeline.history(room.id, h.users[1].id, Some(5)).await.unwrap();
        assert_eq!(short.len(), 5);
    }
}
