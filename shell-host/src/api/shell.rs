//! Shell channel - binds one WebSocket connection to the shell's PTY
//!
//! Output goes out as binary frames, backlog first. Text and binary frames
//! from the peer are written to the PTY unchanged.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ulid::Ulid;

use crate::app_state::AppState;

pub async fn shell_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_shell_socket(socket, state))
}

async fn handle_shell_socket(mut socket: WebSocket, state: AppState) {
    let connection_id = Ulid::new();
    let shell = state.shell().clone();

    let attachment = match shell.attach().await {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::warn!(%connection_id, "refusing shell channel: {e}");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "shell exited".into(),
                })))
                .await;
            return;
        }
    };
    tracing::info!(%connection_id, backlog_chunks = attachment.backlog.len(), "shell channel open");

    let (mut sender, mut receiver) = socket.split();
    let mut output = attachment.output;
    let backlog = attachment.backlog;

    let forward_task = tokio::spawn(async move {
        for chunk in backlog {
            if sender.send(Message::Binary(chunk)).await.is_err() {
                return;
            }
        }
        while let Some(chunk) = output.recv().await {
            if sender.send(Message::Binary(chunk)).await.is_err() {
                return;
            }
        }
        // Output only ends when the shell is gone.
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "shell exited".into(),
            })))
            .await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let data = match msg {
            Message::Binary(data) => data,
            Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Message::Close(_) => break,
            _ => continue,
        };
        if let Err(e) = shell.write(data).await {
            tracing::warn!(%connection_id, "dropping input: {e}");
            break;
        }
    }

    forward_task.abort();
    tracing::info!(%connection_id, "shell channel closed");
}
