//! WebSocket endpoint for remote listeners.
//!
//! The `/ws/events` endpoint upgrades an HTTP connection to a WebSocket and
//! registers it with the [`Broadcaster`](parley_core::broadcast::Broadcaster).
//! Outbound events are pushed by the broadcaster on the event loop; this
//! handler only reads client commands and deregisters the connection when the
//! client goes away.
//!
//! Disconnecting does **not** cancel a running request. Clients cancel
//! explicitly with a `cancel` command.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::broadcast::{Connection, ConnectionId};
use parley_types::error::DeliveryFailure;
use tokio::sync::Mutex;

use crate::state::AppState;

/// Incoming command from a WebSocket client.
///
/// Unknown or malformed messages are logged and ignored.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Cancel a pool task by name.
    Cancel { task: String },
    /// Reply with the current request snapshot.
    Status,
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

/// Outbound half of one websocket, registered with the broadcaster.
pub struct WsConnection {
    id: ConnectionId,
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsConnection {
    fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender: Mutex::new(sender),
        }
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_text(&self, message: &str) -> Result<(), DeliveryFailure> {
        self.sender
            .lock()
            .await
            .send(Message::Text(message.into()))
            .await
            .map_err(|err| DeliveryFailure::Send(err.to_string()))
    }
}

/// Upgrade an HTTP request to a listener connection.
///
/// This is mounted at `/ws/events` in the router.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let connection = Arc::new(WsConnection::new(ws_sender));
    let id = state.broadcaster.connect_shared(connection.clone());

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => process_command(&text, &connection, &state).await,
            Ok(Message::Close(_)) => break,
            Err(err) => {
                tracing::debug!(connection = %id, "WebSocket receive error: {err}");
                break;
            }
            // Binary and protocol frames are handled by axum/tungstenite.
            Ok(_) => {}
        }
    }

    state.broadcaster.disconnect(id);
    tracing::debug!(connection = %id, "WebSocket connection closed");
}

/// Parse and process a single command from the WebSocket client.
async fn process_command(text: &str, connection: &WsConnection, state: &AppState) {
    let cmd: WsCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::debug!("Ignoring unrecognized WebSocket message: {err}");
            return;
        }
    };

    let reply = match cmd {
        WsCommand::Cancel { task } => {
            let cancelled = state.pool.cancel(&task);
            tracing::info!(task = %task, cancelled, "Cancel requested over WebSocket");
            serde_json::json!({ "type": "cancel_ack", "task": task, "cancelled": cancelled })
        }
        WsCommand::Status => {
            serde_json::json!({ "type": "status", "request": state.tracker.snapshot() })
        }
        WsCommand::Ping => serde_json::json!({ "type": "pong" }),
    };

    if let Err(err) = connection.send_text(&reply.to_string()).await {
        tracing::debug!(connection = %connection.id, error = %err, "Failed to answer command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        let cmd: WsCommand = serde_json::from_str(r#"{"type":"cancel","task":"task-3"}"#).unwrap();
        assert!(matches!(cmd, WsCommand::Cancel { ref task } if task == "task-3"));
        assert!(matches!(
            serde_json::from_str::<WsCommand>(r#"{"type":"ping"}"#).unwrap(),
            WsCommand::Ping
        ));
        assert!(serde_json::from_str::<WsCommand>(r#"{"type":"reboot"}"#).is_err());
    }
}
