//! Channel-pair bridging between a client WebSocket and a sandbox shell.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::extract::ws::{self, CloseFrame as ClientCloseFrame, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use ulid::Ulid;

/// Close code sent to the client when the sandbox side fails.
const CLOSE_UPSTREAM_ERROR: u16 = ws::close_code::ERROR;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("sandbox at {url} unreachable: {source}")]
    UpstreamUnreachable {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("sandbox at {url} did not accept the channel within {timeout:?}")]
    UpstreamTimeout { url: String, timeout: Duration },
}

/// Messages forwarded in each direction over the lifetime of one pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PairStats {
    pub client_to_sandbox: u64,
    pub sandbox_to_client: u64,
}

/// Build the sandbox-facing URL for `port` on `host`.
pub fn upstream_url(host: IpAddr, port: u16, path: &str) -> String {
    format!("ws://{}{path}", SocketAddr::new(host, port))
}

/// Open the sandbox-facing channel at `url`, then relay messages both ways
/// until either side closes or errors. Closing one end closes the other.
///
/// If the upstream channel cannot be opened the client is closed with an
/// error frame and no retry is attempted.
pub async fn bridge(
    mut client_ws: WebSocket,
    url: String,
    connect_timeout: Duration,
) -> Result<PairStats, BridgeError> {
    let pair_id = Ulid::new();
    debug!(%pair_id, %url, "opening sandbox channel");

    let upstream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(source)) => {
            close_client(&mut client_ws, "sandbox unreachable").await;
            return Err(BridgeError::UpstreamUnreachable { url, source });
        }
        Err(_) => {
            close_client(&mut client_ws, "sandbox unreachable").await;
            return Err(BridgeError::UpstreamTimeout {
                url,
                timeout: connect_timeout,
            });
        }
    };
    info!(%pair_id, %url, "channel pair open");

    let (mut client_sink, mut client_stream) = client_ws.split();
    let (mut server_sink, mut server_stream) = upstream.split();
    let mut stats = PairStats::default();
    let client_to_sandbox = &mut stats.client_to_sandbox;
    let sandbox_to_client = &mut stats.sandbox_to_client;

    // client → sandbox
    let c2s = async {
        while let Some(msg) = client_stream.next().await {
            let Ok(msg) = msg else { break };
            let is_close = matches!(msg, ws::Message::Close(_));
            if let Some(msg) = client_to_upstream(msg) {
                if server_sink.send(msg).await.is_err() {
                    break;
                }
                *client_to_sandbox += 1;
            }
            if is_close {
                break;
            }
        }
        let _ = server_sink.close().await;
    };

    // sandbox → client
    let s2c = async {
        let mut clean_close = false;
        while let Some(msg) = server_stream.next().await {
            let Ok(msg) = msg else { break };
            let is_close = matches!(msg, Message::Close(_));
            if let Some(msg) = upstream_to_client(msg) {
                if client_sink.send(msg).await.is_err() {
                    break;
                }
                *sandbox_to_client += 1;
            }
            if is_close {
                clean_close = true;
                break;
            }
        }
        if !clean_close {
            let _ = client_sink
                .send(ws::Message::Close(Some(ClientCloseFrame {
                    code: CLOSE_UPSTREAM_ERROR,
                    reason: "sandbox channel lost".into(),
                })))
                .await;
        }
        let _ = client_sink.close().await;
    };

    tokio::select! {
        _ = c2s => {},
        _ = s2c => {},
    }

    info!(
        %pair_id,
        client_to_sandbox = stats.client_to_sandbox,
        sandbox_to_client = stats.sandbox_to_client,
        "channel pair closed"
    );
    Ok(stats)
}

async fn close_client(client_ws: &mut WebSocket, reason: &'static str) {
    let _ = client_ws
        .send(ws::Message::Close(Some(ClientCloseFrame {
            code: CLOSE_UPSTREAM_ERROR,
            reason: reason.into(),
        })))
        .await;
}

fn client_to_upstream(msg: ws::Message) -> Option<Message> {
    Some(match msg {
        ws::Message::Text(t) => Message::Text(t.to_string()),
        ws::Message::Binary(b) => Message::Binary(b.to_vec()),
        ws::Message::Ping(payload) => Message::Ping(payload.to_vec()),
        ws::Message::Pong(payload) => Message::Pong(payload.to_vec()),
        ws::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: Cow::Owned(f.reason.to_string()),
        })),
    })
}

fn upstream_to_client(msg: Message) -> Option<ws::Message> {
    Some(match msg {
        Message::Text(t) => ws::Message::Text(t.into()),
        Message::Binary(b) => ws::Message::Binary(b.into()),
        Message::Ping(payload) => ws::Message::Ping(payload.into()),
        Message::Pong(payload) => ws::Message::Pong(payload.into()),
        Message::Close(frame) => ws::Message::Close(frame.map(|f| ClientCloseFrame {
            code: u16::from(f.code),
            reason: f.reason.into_owned().into(),
        })),
        Message::Frame(_) => return None,
    })
}
