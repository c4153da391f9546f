// ============================
// chat-backend-lib/src/presence.rs
// ============================
//! Presence registry: the in-memory map from user id to live connection.
//!
//! This is the single piece of contended shared state in the server. It
//! is mutated only by the connection protocol handler (register and
//! unregister) and read by the message pipeline and typing router
//! (send and broadcast). It never touches persistence; callers persist
//! state separately and then instruct the registry to notify.

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use chat_common::{ServerEvent, UserId};

use crate::metrics as metric_keys;

/// What the per-connection writer task receives.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialize and deliver an event to the client.
    Event(ServerEvent),
    /// Send a close frame and stop the writer.
    Close,
}

/// One user's live connection: a connection identity plus the sending
/// half of its outbound channel. Ephemeral; a process restart loses all
/// handles and every user is offline until they reconnect.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(conn_id: Uuid, tx: mpsc::Sender<Outbound>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Best-effort delivery; returns false if the writer is gone.
    pub async fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).await.is_ok()
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

/// Mapping from user id to their live connection handle.
///
/// Policy: one live connection per user. Registering while an older
/// connection is still up replaces it; the caller closes the returned
/// stale handle so reconnects never leave an orphaned socket behind.
#[derive(Default)]
pub struct PresenceRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
}

impl PresenceRegistry {
    /// Store the handle, returning the previous one if the user already
    /// had a live connection.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(user_id, handle)
    }

    /// Remove the user's handle, but only if it is still the one given.
    /// Guards against the race where a new connection replaced the old
    /// one before the old close event fired. Returns whether a handle
    /// was removed.
    pub fn unregister(&self, user_id: UserId, conn_id: Uuid) -> bool {
        self.connections
            .remove_if(&user_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    /// Best-effort send to one user. A recipient with no live handle,
    /// or one that disappears between lookup and send, is a no-op.
    pub async fn send_to(&self, user_id: UserId, event: ServerEvent) {
        // clone the handle out so no map guard is held across the await
        let handle = self.connections.get(&user_id).map(|h| h.clone());
        if let Some(handle) = handle {
            if !handle.send(event).await {
                debug!(user_id, "dropping event for closed connection");
            }
        }
    }

    /// Send to every currently registered user except `exclude`.
    /// The recipient set is snapshotted before fan-out starts.
    pub async fn broadcast(&self, event: ServerEvent, exclude: Option<UserId>) {
        let targets: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .map(|entry| entry.value().clone())
            .collect();
        for handle in targets {
            if handle.send(event.clone()).await {
                counter!(metric_keys::EVENTS_BROADCAST).increment(1);
            }
        }
    }
}
