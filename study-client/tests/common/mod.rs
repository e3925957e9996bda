//! In-memory doubles for the relay and the task backend.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use shared_types::{CloseReason, CommandResult, NextTaskResponse, ResetResponse, TaskInfo};
use study_client::backend::{BackendError, TaskBackend};
use study_client::channel::{ChannelError, ChannelEvent, ClientChannel, RelayConnector};
use study_client::controller::{TerminalController, TerminalWidget};
use study_client::detector::PromptPattern;
use study_client::Notice;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const PROMPT: &str = "user@abc123def456:/home$ ";

// ============================================================================
// Relay
// ============================================================================

/// The sandbox end of one channel.
pub struct Peer {
    pub port: u16,
    pub to_client: mpsc::UnboundedSender<ChannelEvent>,
    pub from_client: mpsc::UnboundedReceiver<Bytes>,
}

impl Peer {
    pub fn say(&self, data: &str) {
        let _ = self
            .to_client
            .send(ChannelEvent::Data(Bytes::copy_from_slice(data.as_bytes())));
    }

    /// Resolves once the client drops its side.
    pub async fn wait_closed(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }
}

pub struct MemoryConnector {
    opened: mpsc::UnboundedSender<Peer>,
    pub ports: Mutex<Vec<u16>>,
    pub refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (opened, peers) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opened,
                ports: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
            }),
            peers,
        )
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn open(&self, port: u16) -> Result<ClientChannel, ChannelError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.ports.lock().unwrap().push(port);
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.opened.send(Peer {
            port,
            to_client,
            from_client,
        });
        Ok(ClientChannel { outbound, inbound })
    }
}

#[derive(Clone, Default)]
pub struct Screen(pub Arc<Mutex<Vec<u8>>>);

impl TerminalWidget for Screen {
    fn write(&mut self, data: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(data);
    }
}

pub fn controller(connector: Arc<MemoryConnector>) -> (TerminalController, Screen) {
    let screen = Screen::default();
    let controller = TerminalController::new(
        connector,
        Box::new(PromptPattern::new("user", 12).unwrap()),
        Box::new(screen.clone()),
    );
    (controller, screen)
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("no channel opened")
        .expect("connector dropped")
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
pub struct FakeBackend {
    pub task_infos: Mutex<HashMap<String, TaskInfo>>,
    pub command_results: Mutex<VecDeque<CommandResult>>,
    pub resets: Mutex<VecDeque<(Duration, ResetResponse)>>,
    pub next_tasks: Mutex<VecDeque<NextTaskResponse>>,
    pub transcripts: Mutex<Vec<(String, String)>>,
    pub closed: Mutex<Vec<(String, CloseReason)>>,
}

impl FakeBackend {
    pub fn with_task(self, task_session_id: &str, info: TaskInfo) -> Self {
        self.task_infos
            .lock()
            .unwrap()
            .insert(task_session_id.to_string(), info);
        self
    }

    pub fn push_command_result(&self, status: &str) {
        self.command_results
            .lock()
            .unwrap()
            .push_back(command_result(status));
    }

    pub fn push_reset(&self, delay: Duration, port: u16) {
        self.resets
            .lock()
            .unwrap()
            .push_back((delay, reset_response(port)));
    }

    pub fn push_next_task(&self, value: serde_json::Value) {
        self.next_tasks
            .lock()
            .unwrap()
            .push_back(serde_json::from_value(value).unwrap());
    }
}

#[async_trait]
impl TaskBackend for FakeBackend {
    async fn additional_task_info(&self, task_session_id: &str) -> Result<TaskInfo, BackendError> {
        self.task_infos
            .lock()
            .unwrap()
            .get(task_session_id)
            .cloned()
            .ok_or(BackendError::Status {
                endpoint: "get_additional_task_info",
                status: 404,
            })
    }

    async fn on_command_execution(
        &self,
        task_session_id: &str,
        transcript: &str,
    ) -> Result<CommandResult, BackendError> {
        self.transcripts
            .lock()
            .unwrap()
            .push((task_session_id.to_string(), transcript.to_string()));
        Ok(self
            .command_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| command_result("SUCCESS")))
    }

    async fn reset_file_system(&self, _task_session_id: &str) -> Result<ResetResponse, BackendError> {
        let next = self.resets.lock().unwrap().pop_front();
        let (delay, response) = next.ok_or(BackendError::Status {
            endpoint: "reset_file_system",
            status: 500,
        })?;
        tokio::time::sleep(delay).await;
        Ok(response)
    }

    async fn go_to_next_task(
        &self,
        task_session_id: &str,
        reason: CloseReason,
    ) -> Result<NextTaskResponse, BackendError> {
        self.closed
            .lock()
            .unwrap()
            .push((task_session_id.to_string(), reason));
        self.next_tasks
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(BackendError::Status {
                endpoint: "go_to_next_task",
                status: 500,
            })
    }
}

pub fn task_info(port: u16, time_left: Option<u64>) -> TaskInfo {
    serde_json::from_value(json!({
        "container_port": port,
        "filesystem_status": "FILE_SYSTEM_WRITTEN_TO_DISK",
        "task_id": 1,
        "task_duration": 600,
        "time_left": time_left,
    }))
    .unwrap()
}

pub fn command_result(status: &str) -> CommandResult {
    serde_json::from_value(json!({
        "status": status,
        "filesystem_diff": {"tag": "changed"},
    }))
    .unwrap()
}

pub fn reset_response(port: u16) -> ResetResponse {
    serde_json::from_value(json!({
        "container_port": port,
        "filesystem_status": "FILE_SYSTEM_WRITTEN_TO_DISK",
    }))
    .unwrap()
}

// ============================================================================
// Notices
// ============================================================================

/// Wait for the first notice matching `pred`, returning it.
pub async fn wait_for_notice<F>(notices: &mut mpsc::UnboundedReceiver<Notice>, pred: F) -> Notice
where
    F: Fn(&Notice) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let notice = tokio::time::timeout_at(deadline, notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed");
        if pred(&notice) {
            return notice;
        }
    }
}
