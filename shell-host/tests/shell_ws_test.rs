//! Shell Channel WebSocket Tests
//!
//! Spawns `/bin/sh` in a temp directory, serves it on an ephemeral port and
//! drives it through a real WebSocket client.

#![cfg(unix)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use shell_host::actors::{spawn_shell, ShellHandle, ShellSpec};
use shell_host::api;
use shell_host::app_state::AppState;
use shell_host::ShellHostError;

struct TestServer {
    addr: SocketAddr,
    shell: ShellHandle,
    _temp_dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_test_server() -> TestServer {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let mut spec = ShellSpec::new("/bin/sh", temp_dir.path());
    spec.environment.push(("PS1".to_string(), "$ ".to_string()));
    let shell = spawn_shell(spec).await.expect("Failed to spawn shell");

    let app = api::router(AppState::new(shell.clone()));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("Server failed");
    });

    TestServer {
        addr,
        shell,
        _temp_dir: temp_dir,
        handle,
    }
}

/// Collect binary output until `needle` shows up. Returns everything seen.
async fn recv_until(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    needle: &str,
) -> String {
    let start = Instant::now();
    let mut seen = Vec::new();
    while !String::from_utf8_lossy(&seen).contains(needle) {
        let remaining = Duration::from_secs(5).saturating_sub(start.elapsed());
        match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => seen.extend_from_slice(&data),
            Ok(Some(Ok(Message::Close(_)))) => panic!("Connection closed"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("Frame error: {e:?}"),
            Ok(None) => panic!("Stream ended"),
            Err(_) => panic!(
                "Timeout waiting for {needle:?}; saw {:?}",
                String::from_utf8_lossy(&seen)
            ),
        }
    }
    String::from_utf8_lossy(&seen).to_string()
}

#[tokio::test]
async fn test_shell_channel_round_trip() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/", server.addr))
        .await
        .expect("Failed to connect WebSocket");

    ws.send(Message::Binary(b"printf 'a%sb\\n' XYZ\n".to_vec()))
        .await
        .expect("Send error");
    recv_until(&mut ws, "aXYZb").await;

    // Text frames are written to the PTY as-is too.
    ws.send(Message::Text("printf 'c%sd\\n' TXT\n".to_string()))
        .await
        .expect("Send error");
    recv_until(&mut ws, "cTXTd").await;
}

#[tokio::test]
async fn test_any_path_reaches_the_shell() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/term/0", server.addr))
        .await
        .expect("Failed to connect WebSocket");

    ws.send(Message::Binary(b"printf 'p%sq\\n' PATH\n".to_vec()))
        .await
        .expect("Send error");
    recv_until(&mut ws, "pPATHq").await;
}

#[tokio::test]
async fn test_reconnect_redraws_only_the_prompt() {
    let server = start_test_server().await;
    {
        let (mut ws, _) = connect_async(format!("ws://{}/", server.addr))
            .await
            .expect("Failed to connect WebSocket");
        ws.send(Message::Binary(b"printf 'r%sr\\n' ONE\n".to_vec()))
            .await
            .expect("Send error");
        recv_until(&mut ws, "rONEr\r\n$ ").await;
        let _ = ws.close(None).await;
    }

    let (mut ws, _) = connect_async(format!("ws://{}/", server.addr))
        .await
        .expect("Failed to reconnect WebSocket");
    let replayed = recv_until(&mut ws, "$ ").await;
    assert_eq!(replayed, "$ ");

    // Earlier command output is not sent again.
    let extra = timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "unexpected frame after replay: {extra:?}");
}

#[tokio::test]
async fn test_shell_exit_closes_channel_and_fails_writes() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/", server.addr))
        .await
        .expect("Failed to connect WebSocket");

    ws.send(Message::Binary(b"exit\n".to_vec()))
        .await
        .expect("Send error");

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "channel was not closed after shell exit");

    let exit = timeout(Duration::from_secs(5), server.shell.wait_exit())
        .await
        .expect("shell did not report exit");
    assert_eq!(exit.exit_code, Some(0));
    assert_eq!(
        server.shell.write(bytes_of("ls\n")).await,
        Err(ShellHostError::ChannelClosed)
    );

    // New connections are turned away.
    let (mut ws, _) = connect_async(format!("ws://{}/", server.addr))
        .await
        .expect("Upgrade still succeeds");
    let frame = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no close frame");
    assert!(matches!(frame, Some(Ok(Message::Close(_))) | None));
}

async fn get_health(addr: SocketAddr) -> (String, serde_json::Value) {
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("Failed to connect");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("Write error");
    let mut raw = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut raw))
        .await
        .expect("health timed out")
        .expect("Read error");
    let (head, body) = raw.split_once("\r\n\r\n").expect("no header terminator");
    let status_line = head.lines().next().unwrap_or_default().to_string();
    let body = serde_json::from_str(body.trim()).expect("health body is not JSON");
    (status_line, body)
}

#[tokio::test]
async fn test_health_reports_running_shell() {
    let server = start_test_server().await;

    let (status_line, body) = get_health(server.addr).await;
    assert!(status_line.contains("200"), "status line {status_line:?}");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["shell"]["is_running"], true);
    assert_eq!(body["shell"]["shell"], "/bin/sh");
    assert_eq!(
        body["shell"]["process_id"].as_u64(),
        server.shell.process_id().map(u64::from)
    );
}

fn bytes_of(s: &'static str) -> bytes::Bytes {
    bytes::Bytes::from_static(s.as_bytes())
}
