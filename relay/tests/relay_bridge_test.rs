//! Relay Bridge Integration Tests
//!
//! A stand-in shell host listens on an ephemeral port; clients connect
//! through the relay at `/<port>` and exchange frames with it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use relay::{router, RelayState};

#[derive(Clone, Copy)]
enum UpstreamMode {
    /// Echo every data frame back.
    Echo,
    /// Send one frame and close immediately.
    SayGoodbye,
}

struct Upstream {
    port: u16,
    connections: Arc<AtomicUsize>,
    /// Echo channels that have ended, by close frame or EOF.
    ended: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_upstream(mode: UpstreamMode) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream");
    let port = listener.local_addr().expect("Failed to get addr").port();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let ended = Arc::new(AtomicUsize::new(0));
    let ended_counter = Arc::clone(&ended);

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let ended_counter = Arc::clone(&ended_counter);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                match mode {
                    UpstreamMode::Echo => {
                        while let Some(Ok(msg)) = ws.next().await {
                            if msg.is_binary() || msg.is_text() {
                                if ws.send(msg).await.is_err() {
                                    break;
                                }
                            } else if msg.is_close() {
                                break;
                            }
                        }
                        ended_counter.fetch_add(1, Ordering::SeqCst);
                    }
                    UpstreamMode::SayGoodbye => {
                        let _ = ws.send(Message::Binary(b"logout\r\n".to_vec())).await;
                        let _ = ws.close(None).await;
                    }
                }
            });
        }
    });

    Upstream {
        port,
        connections,
        ended,
        handle,
    }
}

struct TestRelay {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_relay() -> TestRelay {
    let state = RelayState {
        upstream_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        upstream_connect_timeout: Duration::from_secs(2),
    };
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind relay");
    let addr = listener.local_addr().expect("Failed to get addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, router(state).into_make_service())
            .await
            .expect("Server failed");
    });
    TestRelay { addr, handle }
}

async fn next_data(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Message {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(msg))) if msg.is_binary() || msg.is_text() || msg.is_close() => {
                return msg
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("Frame error: {e:?}"),
            Ok(None) => panic!("Stream ended"),
            Err(_) => panic!("Timeout waiting for frame"),
        }
    }
}

#[tokio::test]
async fn test_bytes_relay_unmodified_in_both_directions() {
    let upstream = start_upstream(UpstreamMode::Echo).await;
    let relay = start_relay().await;

    let (mut ws, _) = connect_async(format!("ws://{}/{}", relay.addr, upstream.port))
        .await
        .expect("Failed to connect through relay");

    let payload = b"ls -la\r\x1b[A\xff\x00".to_vec();
    ws.send(Message::Binary(payload.clone()))
        .await
        .expect("Send error");
    assert_eq!(next_data(&mut ws).await, Message::Binary(payload));

    ws.send(Message::Text("echo hi\r".to_string()))
        .await
        .expect("Send error");
    assert_eq!(next_data(&mut ws).await, Message::Text("echo hi\r".to_string()));

    assert_eq!(upstream.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_each_client_gets_its_own_upstream_channel() {
    let upstream = start_upstream(UpstreamMode::Echo).await;
    let relay = start_relay().await;
    let url = format!("ws://{}/{}", relay.addr, upstream.port);

    let (mut first, _) = connect_async(url.as_str()).await.expect("first connect");
    let (mut second, _) = connect_async(url.as_str()).await.expect("second connect");

    first
        .send(Message::Binary(b"one".to_vec()))
        .await
        .expect("Send error");
    second
        .send(Message::Binary(b"two".to_vec()))
        .await
        .expect("Send error");

    assert_eq!(next_data(&mut first).await, Message::Binary(b"one".to_vec()));
    assert_eq!(next_data(&mut second).await, Message::Binary(b"two".to_vec()));
    assert_eq!(upstream.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_malformed_paths_are_refused_without_upstream_channel() {
    let upstream = start_upstream(UpstreamMode::Echo).await;
    let relay = start_relay().await;

    for path in ["/", "/abc", "/-1", "/99999"] {
        let result = connect_async(format!("ws://{}{path}", relay.addr)).await;
        assert!(result.is_err(), "path {path} should be refused");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upstream_close_closes_client() {
    let upstream = start_upstream(UpstreamMode::SayGoodbye).await;
    let relay = start_relay().await;

    let (mut ws, _) = connect_async(format!("ws://{}/{}", relay.addr, upstream.port))
        .await
        .expect("Failed to connect through relay");

    assert_eq!(
        next_data(&mut ws).await,
        Message::Binary(b"logout\r\n".to_vec())
    );
    assert!(next_data(&mut ws).await.is_close());
}

#[tokio::test]
async fn test_unreachable_sandbox_closes_client_with_error() {
    let unused_port = {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        listener.local_addr().expect("Failed to get addr").port()
    };
    let relay = start_relay().await;

    let (mut ws, _) = connect_async(format!("ws://{}/{unused_port}", relay.addr))
        .await
        .expect("Upgrade should succeed before the upstream is tried");

    match next_data(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Error),
        other => panic!("expected error close, got {other:?}"),
    }
}

async fn wait_for_upstream_end(upstream: &Upstream, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while upstream.ended.load(Ordering::SeqCst) < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sandbox side still open after client went away"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_client_close_closes_upstream() {
    let upstream = start_upstream(UpstreamMode::Echo).await;
    let relay = start_relay().await;
    let url = format!("ws://{}/{}", relay.addr, upstream.port);

    // Graceful close handshake.
    let (mut ws, _) = connect_async(url.as_str()).await.expect("connect");
    ws.send(Message::Binary(b"pwd\r".to_vec()))
        .await
        .expect("Send error");
    assert_eq!(next_data(&mut ws).await, Message::Binary(b"pwd\r".to_vec()));
    ws.close(None).await.expect("close");
    wait_for_upstream_end(&upstream, 1).await;

    // Abrupt drop without a close frame.
    let (mut ws, _) = connect_async(url.as_str()).await.expect("connect");
    ws.send(Message::Binary(b"ls\r".to_vec()))
        .await
        .expect("Send error");
    assert_eq!(next_data(&mut ws).await, Message::Binary(b"ls\r".to_vec()));
    drop(ws);
    wait_for_upstream_end(&upstream, 2).await;

    assert_eq!(upstream.connections.load(Ordering::SeqCst), 2);
}
