// ============================
// chat-backend-lib/src/lib.rs
// ============================
//! Core library for the real-time chat backend.
//!
//! The durable side (users, rooms, memberships, messages) lives behind
//! the [`storage::Storage`] gateway; the live side (connections,
//! presence, typing) lives in [`presence::PresenceRegistry`] and
//! [`typing::TypingRouter`]. The connection protocol handler in
//! [`websocket`] is the only component that mutates both, which keeps
//! REST-fetched history and live events from contradicting each other.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod presence;
pub mod rest;
pub mod rooms;
pub mod storage;
pub mod typing;
pub mod websocket;
pub mod ws_router;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::pipeline::MessagePipeline;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomDirectory;
use crate::storage::Storage;
use crate::typing::TypingRouter;

/// Application state shared across all handlers
pub struct AppState<S> {
    /// Persistence gateway
    pub storage: S,
    /// Live connection registry
    pub presence: Arc<PresenceRegistry>,
    /// Typing signal router
    pub typing: TypingRouter,
    /// Settings
    pub settings: Arc<Settings>,
    pipeline: MessagePipeline<S>,
}

impl<S: Storage + Clone> AppState<S> {
    /// Create a new application state
    pub fn new(storage: S, settings: Settings) -> Self {
        let presence = Arc::new(PresenceRegistry::default());
        let typing = TypingRouter::new(
            Arc::clone(&presence),
            Duration::from_secs(settings.typing_expiry_secs),
        );
        let pipeline = MessagePipeline::new(
            storage.clone(),
            Arc::clone(&presence),
            settings.history_limit,
        );
        Self {
            storage,
            presence,
            typing,
            settings: Arc::new(settings),
            pipeline,
        }
    }

    /// The room membership resolver over this state's storage.
    pub fn rooms(&self) -> RoomDirectory<S> {
        RoomDirectory::new(self.storage.clone())
    }

    /// The shared message pipeline. Clones share the per-room
    /// submission locks, so every handler serializes on the same ones.
    pub fn pipeline(&self) -> MessagePipeline<S> {
        self.pipeline.clone()
    }
}

/// The full application router: WebSocket endpoint plus REST boundary.
pub fn app<S: Storage + Clone + Send + Sync + 'static>(state: Arc<AppState<S>>) -> Router {
    ws_router::create_router(Arc::clone(&state))
        .merge(rest::create_router(state))
        .layer(TraceLayer::new_for_http())
}
