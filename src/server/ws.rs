use crate::state::{AppState, EngineSnapshot};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// First frame on every connection.
#[derive(serde::Serialize)]
struct Hello<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    snapshot: &'a EngineSnapshot,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ws_tx.subscribe();

    // Send initial snapshot
    {
        let snapshot = state.snapshot_rx.borrow().clone();
        let hello = Hello { kind: "snapshot", snapshot: &snapshot };
        if let Ok(json) = serde_json::to_string(&hello) {
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    }

    // Forward engine events to this client
    let send_task = tokio::spawn(async move {
        loop {
            let ws_msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ws client lagging, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match serde_json::to_string(&ws_msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "ws encode failed"),
            }
        }
    });

    // Clients only listen; drain until disconnect
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
