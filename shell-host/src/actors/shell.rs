//! ShellActor - owns the sandbox's single PTY-backed shell
//!
//! The PTY is opened and the shell spawned before the actor starts, so
//! spawn failures come back to the caller as [`ShellHostError`] values.
//! Blocking PTY I/O runs on `spawn_blocking` threads that feed the actor's
//! mailbox; the actor keeps the current output line as a backlog and fans output out to
//! attached connections in mailbox order.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::{mpsc, watch};

use crate::error::ShellHostError;

/// How long to keep draining PTY output after the child has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 4096;

// ============================================================================
// Spawn Parameters
// ============================================================================

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub shell: String,
    pub working_dir: PathBuf,
    /// Extra variables layered over the inherited environment.
    pub environment: Vec<(String, String)>,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    pub backlog_limit: usize,
}

impl ShellSpec {
    pub fn new(shell: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: working_dir.into(),
            environment: Vec::new(),
            term: "xterm-color".to_string(),
            rows: 24,
            cols: 80,
            backlog_limit: 64 * 1024,
        }
    }
}

/// How the shell process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShellExit {
    pub exit_code: Option<i32>,
}

// ============================================================================
// Messages
// ============================================================================

/// A new connection's view of the shell: the unfinished current line, then
/// every chunk produced afterwards.
#[derive(Debug)]
pub struct Attachment {
    pub backlog: Vec<Bytes>,
    pub output: mpsc::UnboundedReceiver<Bytes>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ShellInfo {
    pub shell: String,
    pub working_dir: String,
    pub process_id: Option<u32>,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub attached: usize,
}

#[derive(Debug)]
pub enum ShellMsg {
    /// Write raw bytes to the PTY master
    Write {
        data: Bytes,
        reply: RpcReplyPort<Result<(), ShellHostError>>,
    },
    /// Snapshot the backlog and subscribe to live output
    Attach {
        reply: RpcReplyPort<Result<Attachment, ShellHostError>>,
    },
    GetInfo {
        reply: RpcReplyPort<ShellInfo>,
    },
    /// Kill the shell
    Stop {
        reply: RpcReplyPort<()>,
    },
    /// Internal: output read from the PTY
    OutputReceived { data: Bytes },
    /// Internal: the PTY reader hit EOF or an error
    OutputDrained,
    /// Internal: the child process was reaped
    ChildExited { exit_code: Option<i32> },
}

// ============================================================================
// Actor Implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct ShellActor;

pub struct ShellArguments {
    spec: ShellSpec,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    process_id: Option<u32>,
    exit_tx: watch::Sender<Option<ShellExit>>,
}

pub struct ShellState {
    shell: String,
    working_dir: PathBuf,
    /// Held so the PTY stays open for the reader and writer threads
    #[allow(dead_code)]
    master: Option<Box<dyn MasterPty + Send>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: Option<mpsc::UnboundedSender<Bytes>>,
    backlog: Backlog,
    subscribers: Vec<mpsc::UnboundedSender<Bytes>>,
    is_running: bool,
    child_exited: bool,
    exit_code: Option<i32>,
    process_id: Option<u32>,
    exit_tx: watch::Sender<Option<ShellExit>>,
}

impl ShellState {
    fn publish_exit(&self) {
        if self.exit_tx.borrow().is_none() {
            self.exit_tx.send_replace(Some(ShellExit {
                exit_code: self.exit_code,
            }));
        }
    }

    fn close_io(&mut self) {
        self.is_running = false;
        self.input_tx = None;
        self.subscribers.clear();
    }
}

#[async_trait]
impl Actor for ShellActor {
    type Msg = ShellMsg;
    type State = ShellState;
    type Arguments = ShellArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(ShellState {
            shell: args.spec.shell,
            working_dir: args.spec.working_dir,
            master: Some(args.master),
            killer: Some(args.killer),
            input_tx: Some(args.input_tx),
            backlog: Backlog::new(args.spec.backlog_limit),
            subscribers: Vec::new(),
            is_running: true,
            child_exited: false,
            exit_code: None,
            process_id: args.process_id,
            exit_tx: args.exit_tx,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ShellMsg::Write { data, reply } => {
                let result = match state.input_tx {
                    Some(ref tx) => tx.send(data).map_err(|_| ShellHostError::ChannelClosed),
                    None => Err(ShellHostError::ChannelClosed),
                };
                let _ = reply.send(result);
            }

            ShellMsg::Attach { reply } => {
                if !state.is_running {
                    let _ = reply.send(Err(ShellHostError::ChannelClosed));
                    return Ok(());
                }
                let (tx, rx) = mpsc::unbounded_channel();
                state.subscribers.push(tx);
                tracing::debug!(attached = state.subscribers.len(), "connection attached to shell");
                let _ = reply.send(Ok(Attachment {
                    backlog: state.backlog.snapshot(),
                    output: rx,
                }));
            }

            ShellMsg::GetInfo { reply } => {
                let _ = reply.send(ShellInfo {
                    shell: state.shell.clone(),
                    working_dir: state.working_dir.to_string_lossy().to_string(),
                    process_id: state.process_id,
                    is_running: state.is_running,
                    exit_code: state.exit_code,
                    attached: state.subscribers.len(),
                });
            }

            ShellMsg::Stop { reply } => {
                if let Some(mut killer) = state.killer.take() {
                    if let Err(e) = killer.kill() {
                        tracing::warn!(error = %e, "Failed to kill shell process");
                    }
                }
                state.close_io();
                let _ = reply.send(());
            }

            ShellMsg::OutputReceived { data } => {
                state.backlog.push(data.clone());
                state.subscribers.retain(|tx| tx.send(data.clone()).is_ok());
            }

            ShellMsg::ChildExited { exit_code } => {
                tracing::info!(?exit_code, process_id = ?state.process_id, "shell exited");
                state.child_exited = true;
                state.exit_code = exit_code;
                state.killer = None;
                // The reader usually reports EOF right after; don't wait on it forever.
                myself.send_after(EXIT_DRAIN_GRACE, || ShellMsg::OutputDrained);
            }

            ShellMsg::OutputDrained => {
                if state.child_exited {
                    state.close_io();
                    state.master = None;
                    state.publish_exit();
                    myself.stop(Some("shell exited".to_string()));
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(mut killer) = state.killer.take() {
            let _ = killer.kill();
        }
        state.close_io();
        state.master = None;
        state.publish_exit();
        Ok(())
    }
}

// ============================================================================
// Output Backlog
// ============================================================================

/// Output since the last newline, capped at `limit` bytes. Oldest bytes go
/// first. Completed lines are never replayed, so a reconnecting client only
/// redraws the current prompt line.
struct Backlog {
    chunks: VecDeque<Bytes>,
    len: usize,
    limit: usize,
}

impl Backlog {
    fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: Bytes) {
        if self.limit == 0 || chunk.is_empty() {
            return;
        }
        let chunk = match last_newline(&chunk) {
            Some(pos) => {
                self.chunks.clear();
                self.len = 0;
                chunk.slice(pos + 1..)
            }
            None => chunk,
        };
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);

        while self.len > self.limit {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            let excess = self.len - self.limit;
            if front.len() > excess {
                self.chunks.push_front(front.slice(excess..));
                self.len -= excess;
            } else {
                self.len -= front.len();
            }
        }
    }

    fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }
}

fn last_newline(data: &[u8]) -> Option<usize> {
    data.iter().rposition(|&b| b == b'\n')
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to the running shell.
#[derive(Clone)]
pub struct ShellHandle {
    actor: ActorRef<ShellMsg>,
    process_id: Option<u32>,
    exit_rx: watch::Receiver<Option<ShellExit>>,
}

impl ShellHandle {
    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub async fn write(&self, data: Bytes) -> Result<(), ShellHostError> {
        ractor::call!(self.actor, |reply| ShellMsg::Write { data, reply })
            .map_err(|_| ShellHostError::ChannelClosed)?
    }

    pub async fn attach(&self) -> Result<Attachment, ShellHostError> {
        ractor::call!(self.actor, |reply| ShellMsg::Attach { reply })
            .map_err(|_| ShellHostError::ChannelClosed)?
    }

    /// `None` once the actor is gone.
    pub async fn info(&self) -> Option<ShellInfo> {
        ractor::call!(self.actor, |reply| ShellMsg::GetInfo { reply }).ok()
    }

    pub async fn stop(&self) {
        let _ = ractor::call!(self.actor, |reply| ShellMsg::Stop { reply });
    }

    /// Resolves once the shell has exited and every connection was closed.
    pub async fn wait_exit(&self) -> ShellExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            Err(_) => ShellExit::default(),
        };
        exit
    }
}

// ============================================================================
// PTY Implementation
// ============================================================================

/// Open a PTY, start `spec.shell` on it and hand both to a new [`ShellActor`].
pub async fn spawn_shell(spec: ShellSpec) -> Result<ShellHandle, ShellHostError> {
    if !spec.working_dir.is_dir() {
        return Err(ShellHostError::InvalidWorkingDirectory(
            spec.working_dir.clone(),
        ));
    }

    let pty_system = portable_pty::native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ShellHostError::ProcessSpawn(e.to_string()))?;

    let mut cmd_builder = CommandBuilder::new(&spec.shell);
    cmd_builder.cwd(&spec.working_dir);
    cmd_builder.env("TERM", &spec.term);
    for (key, value) in &spec.environment {
        cmd_builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd_builder)
        .map_err(|e| ShellHostError::ProcessSpawn(format!("{}: {e}", spec.shell)))?;
    drop(pair.slave);
    let killer = child.clone_killer();
    let process_id = child.process_id();

    let mut master_writer = pair
        .master
        .take_writer()
        .map_err(|e| ShellHostError::ProcessSpawn(format!("Failed to get PTY writer: {e}")))?;
    let mut master_reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ShellHostError::ProcessSpawn(format!("Failed to clone PTY reader: {e}")))?;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
    let (exit_tx, exit_rx) = watch::channel(None);

    let (actor, _handle) = Actor::spawn(
        None,
        ShellActor,
        ShellArguments {
            spec: spec.clone(),
            master: pair.master,
            killer,
            input_tx,
            process_id,
            exit_tx,
        },
    )
    .await
    .map_err(|e| ShellHostError::ProcessSpawn(format!("Failed to start shell actor: {e}")))?;

    tracing::info!(
        shell = %spec.shell,
        working_dir = %spec.working_dir.display(),
        ?process_id,
        "shell spawned"
    );

    // input: channel → PTY
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if master_writer.write_all(&data).is_err() {
                break;
            }
            if master_writer.flush().is_err() {
                break;
            }
        }
    });

    // output: PTY → actor mailbox
    let reader_actor = actor.clone();
    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            match master_reader.read(&mut buffer) {
                Ok(0) | Err(_) => {
                    let _ = reader_actor.send_message(ShellMsg::OutputDrained);
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buffer[..n]);
                    if reader_actor
                        .send_message(ShellMsg::OutputReceived { data })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // exit monitor
    let monitor_actor = actor.clone();
    tokio::task::spawn_blocking(move || {
        let exit_code = child.wait().ok().map(|status| status.exit_code() as i32);
        let _ = monitor_actor.send_message(ShellMsg::ChildExited { exit_code });
    });

    Ok(ShellHandle {
        actor,
        process_id,
        exit_rx,
    })
}
