// ============================
// chat-backend-lib/src/websocket.rs
// ============================
//! Connection protocol handler.
//!
//! One `ChatSocketHandler` per physical connection, driving the
//! unauthenticated -> active -> closed state machine. Inbound frames are
//! dispatched to the message pipeline and typing router; every failure
//! is surfaced to the originating connection as an `error` event and
//! never closes the connection or leaks to other connections.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chat_common::{ClientFrame, ServerEvent, UserId};

use crate::error::AppError;
use crate::pipeline::MessagePipeline;
use crate::presence::{ConnectionHandle, Outbound};
use crate::rooms::RoomDirectory;
use crate::storage::Storage;
use crate::AppState;

pub struct ChatSocketHandler<S: Storage + Clone> {
    state: Arc<AppState<S>>,
    rooms: RoomDirectory<S>,
    pipeline: MessagePipeline<S>,
    conn_id: Uuid,
    user_id: Option<UserId>,
}

impl<S: Storage + Clone + Send + Sync + 'static> ChatSocketHandler<S> {
    pub fn new(state: Arc<AppState<S>>) -> Self {
        Self {
            rooms: state.rooms(),
            pipeline: state.pipeline(),
            state,
            conn_id: Uuid::new_v4(),
            user_id: None,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// Process one inbound frame. Errors are returned for the caller to
    /// render as an `error` event on this connection; state never
    /// changes on failure.
    pub async fn handle_frame(
        &mut self,
        frame: ClientFrame,
        tx: &mpsc::Sender<Outbound>,
    ) -> Result<(), AppError> {
        match frame {
            ClientFrame::Auth { user_id } => self.handle_auth(user_id, tx).await,
            ClientFrame::SendMessage { room_id, content } => {
                let sender_id = self.require_auth()?;
                self.pipeline.submit(room_id, sender_id, &content).await?;
                Ok(())
            },
            ClientFrame::Typing { room_id, is_typing } => {
                let user_id = self.require_auth()?;
                if !self.rooms.is_member(user_id, room_id).await? {
                    return Err(AppError::Forbidden(format!(
                        "user {user_id} is not a member of room {room_id}"
                    )));
                }
                let members = self.rooms.members_of(room_id).await?;
                self.state
                    .typing
                    .notify(room_id, user_id, is_typing, &members)
                    .await;
                Ok(())
            },
        }
    }

    /// Transport closed, from either side. Idempotent: a connection that
    /// never authenticated performs no presence or persistence work.
    pub async fn handle_close(&mut self) {
        let Some(user_id) = self.user_id.take() else {
            return;
        };
        // skip everything if a newer connection already replaced us
        if !self.state.presence.unregister(user_id, self.conn_id) {
            debug!(user_id, conn_id = %self.conn_id, "connection already replaced, no offline transition");
            return;
        }
        if let Err(err) = self.state.storage.update_online_status(user_id, false).await {
            // durable flag may transiently disagree; the broadcast still goes out
            warn!(user_id, error = %err, "failed to persist offline status");
        }
        info!(user_id, conn_id = %self.conn_id, "user disconnected");
        self.state
            .presence
            .broadcast(
                ServerEvent::Presence {
                    user_id,
                    online: false,
                },
                None,
            )
            .await;
    }

    async fn handle_auth(
        &mut self,
        user_id: UserId,
        tx: &mpsc::Sender<Outbound>,
    ) -> Result<(), AppError> {
        if self.user_id.is_some() {
            return Err(AppError::InvalidArgument(
                "connection is already authenticated".to_string(),
            ));
        }
        // the frame must carry a known user id
        self.state.storage.get_user_by_id(user_id).await?;

        let handle = ConnectionHandle::new(self.conn_id, tx.clone());
        if let Some(stale) = self.state.presence.register(user_id, handle) {
            debug!(user_id, "closing stale connection after reconnect");
            stale.close();
        }
        self.user_id = Some(user_id);

        if let Err(err) = self.state.storage.update_online_status(user_id, true).await {
            warn!(user_id, error = %err, "failed to persist online status");
        }
        info!(user_id, conn_id = %self.conn_id, "user authenticated");

        // everyone learns, the user's own connection included
        self.state
            .presence
            .broadcast(
                ServerEvent::Presence {
                    user_id,
                    online: true,
                },
                None,
            )
            .await;
        Ok(())
    }

    fn require_auth(&self) -> Result<UserId, AppError> {
        self.user_id.ok_or_else(|| {
            AppError::Unauthorized("connection is not authenticated".to_string())
        })
    }
}
