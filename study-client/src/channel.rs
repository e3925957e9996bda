//! Client-facing channels to the relay.
//!
//! A [`ClientChannel`] is a pair of unbounded queues: bytes to send and
//! events received. Dropping the outbound sender closes the channel.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    /// Always the last event of a channel.
    Closed { reason: String },
}

#[derive(Debug)]
pub struct ClientChannel {
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("could not open channel {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("channel {url} not open after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("channel closed")]
    Closed,
}

/// Opens channels to the sandbox shell listening on `port`.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, port: u16) -> Result<ClientChannel, ChannelError>;
}

// ============================================================================
// WebSocket Connector
// ============================================================================

/// Connects to `<relay_base>/<port>` over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    relay_base: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(relay_base: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            relay_base: relay_base.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn open(&self, port: u16) -> Result<ClientChannel, ChannelError> {
        let url = shared_types::channel_url(&self.relay_base, port);
        let (ws, _) = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(source)) => return Err(ChannelError::Connect { url, source }),
            Err(_) => {
                return Err(ChannelError::Timeout {
                    url,
                    timeout: self.connect_timeout,
                })
            }
        };
        tracing::debug!(%url, "channel open");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ChannelEvent>();

        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if sink.send(Message::Binary(data.to_vec())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if inbound_tx.send(ChannelEvent::Data(Bytes::from(data))).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(ChannelEvent::Data(Bytes::from(text))).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by relay ({}): {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by relay".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection dropped".to_string(),
                }
            };
            let _ = inbound_tx.send(ChannelEvent::Closed { reason });
        });

        Ok(ClientChannel { outbound, inbound })
    }
}
