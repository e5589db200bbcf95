//! Per-execution progress channel over a persistent socket.
//!
//! Clients open `/ws/{execution_id}`, the handler subscribes them to the
//! broker and forwards every published event. Client-to-server frames are
//! drained and ignored; on disconnect the subscription is dropped.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AppState;

/// GET /ws/{execution_id}
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(exec_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, exec_id, socket))
}

async fn handle_socket(state: AppState, exec_id: Uuid, socket: WebSocket) {
    info!(execution_id = %exec_id, "websocket connected");
    let (token, mut events) = state.broker.subscribe(exec_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(message) => {
                        if sink.send(Message::Text(message)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(other)) => {
                        // Client frames are ignored; the channel is server-push.
                        debug!(execution_id = %exec_id, "ignoring client frame: {:?}", other);
                    }
                }
            }
        }
    }

    state.broker.unsubscribe(exec_id, token);
    info!(execution_id = %exec_id, "websocket disconnected");
}
