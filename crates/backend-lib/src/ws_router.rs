// ============================
// chat-backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
//!
//! Owns the transport edge: the `/ws` upgrade, the per-connection
//! writer task, JSON decode/encode and connection metrics. Frames are
//! decoded once into [`ClientFrame`] here and pattern-matched in the
//! protocol handler; malformed payloads produce an `error` event and
//! never crash or close the connection.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::debug;

use chat_common::{ClientFrame, ServerEvent};

use crate::metrics as metric_keys;
use crate::presence::Outbound;
use crate::storage::Storage;
use crate::websocket::ChatSocketHandler;
use crate::AppState;

/// Create the WebSocket router
pub fn create_router<S: Storage + Clone + Send + Sync + 'static>(
    state: Arc<AppState<S>>,
) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .with_state(state)
}

/// Handler for WebSocket connections
async fn ws_handler<S: Storage + Clone + Send + Sync + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    counter!(metric_keys::WS_CONNECTION).increment(1);
    gauge!(metric_keys::WS_ACTIVE).increment(1.0);

    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection<S: Storage + Clone + Send + Sync + 'static>(
    socket: WebSocket,
    state: Arc<AppState<S>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.settings.event_buffer);
    let mut handler = ChatSocketHandler::new(state);

    // writer task: everything leaving this connection funnels through
    // one channel, so fan-out from other connections never touches the
    // socket directly
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            debug!(error = %err, "failed to serialize outbound event");
                            continue;
                        },
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                },
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                },
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if let Err(err) = handler.handle_frame(frame, &tx).await {
                        debug!(conn_id = %handler.conn_id(), error = %err, "frame rejected");
                        let error_event = ServerEvent::Error {
                            message: err.to_string(),
                        };
                        if tx.send(Outbound::Event(error_event)).await.is_err() {
                            break;
                        }
                    }
                },
                Err(err) => {
                    let error_event = ServerEvent::Error {
                        message: format!("malformed frame: {err}"),
                    };
                    if tx.send(Outbound::Event(error_event)).await.is_err() {
                        break;
                    }
                },
            },
            Message::Close(_) => break,
            // pings are answered by axum itself
            _ => {},
        }
    }

    handler.handle_close().await;

    counter!(metric_keys::WS_DISCONNECTION).increment(1);
    gauge!(metric_keys::WS_ACTIVE).decrement(1.0);

    send_task.abort();
}
