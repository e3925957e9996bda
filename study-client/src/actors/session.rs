//! SessionActor - runs the task lifecycle against real I/O
//!
//! The actor's mailbox is the single ordered stream the lifecycle machine
//! consumes: participant commands, channel events, timer expiries and
//! backend completions all arrive here. Effects are performed in the order
//! the machine emits them. Backend calls run on spawned tasks and report
//! back as [`SessionMsg::Lifecycle`] messages; transcripts go through one
//! reporter task so they reach the backend in capture order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, MessagingErr, RpcReplyPort};
use shared_types::{Stage, TranscriptEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::TaskBackend;
use crate::channel::ChannelEvent;
use crate::controller::TerminalController;
use crate::lifecycle::{Effect, LifecycleEvent, Snapshot, TaskLifecycle, TimerToken};
use crate::notice::Notice;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum SessionMsg {
    /// Raw participant input for the live channel
    Keystrokes(Bytes),
    /// Reset the sandbox of the running task
    Reset,
    /// Give up on the running task
    Quit,
    /// Move on from a finished task, or retry a failed request
    Advance,
    /// Dismiss a stage-transition notice
    AcknowledgeStage,
    GetSnapshot(RpcReplyPort<Snapshot>),
    /// Internal: event from channel `generation`
    Channel { generation: u64, event: ChannelEvent },
    /// Internal: a session timer expired
    TimerFired(TimerToken),
    /// Internal: a backend call completed
    Lifecycle(LifecycleEvent),
}

// ============================================================================
// Actor Implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct SessionActor;

pub struct SessionArguments {
    pub backend: Arc<dyn TaskBackend>,
    pub controller: TerminalController,
    pub notices: mpsc::UnboundedSender<Notice>,
    /// Task session to load on start, if already known
    pub initial: Option<(String, Stage)>,
}

pub struct SessionState {
    lifecycle: TaskLifecycle,
    controller: TerminalController,
    backend: Arc<dyn TaskBackend>,
    notices: mpsc::UnboundedSender<Notice>,
    initial: Option<(String, Stage)>,
    timers: HashMap<TimerToken, JoinHandle<Result<(), MessagingErr<SessionMsg>>>>,
    reports: mpsc::UnboundedSender<TranscriptEvent>,
    reporter: JoinHandle<()>,
}

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMsg;
    type State = SessionState;
    type Arguments = SessionArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (reports, reporter) = spawn_reporter(args.backend.clone(), myself);
        Ok(SessionState {
            lifecycle: TaskLifecycle::new(),
            controller: args.controller,
            backend: args.backend,
            notices: args.notices,
            initial: args.initial,
            timers: HashMap::new(),
            reports,
            reporter,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some((task_session_id, stage)) = state.initial.take() {
            tracing::info!(%task_session_id, %stage, "starting study session");
            self.run(
                &myself,
                state,
                LifecycleEvent::Assigned {
                    task_session_id,
                    stage,
                },
            )
            .await;
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMsg::Keystrokes(data) => {
                if let Err(e) = state.controller.send_keys(data) {
                    tracing::debug!(error = %e, "dropping keystrokes");
                }
            }
            SessionMsg::Reset => {
                self.run(&myself, state, LifecycleEvent::ResetRequested).await;
            }
            SessionMsg::Quit => {
                self.run(&myself, state, LifecycleEvent::QuitConfirmed).await;
            }
            SessionMsg::Advance => {
                self.run(&myself, state, LifecycleEvent::Advance).await;
            }
            SessionMsg::AcknowledgeStage => {
                self.run(&myself, state, LifecycleEvent::StageAcknowledged)
                    .await;
            }
            SessionMsg::GetSnapshot(reply) => {
                let _ = reply.send(state.lifecycle.snapshot());
            }
            SessionMsg::Channel { generation, event } => match event {
                ChannelEvent::Data(data) => {
                    if let Some(text) = state.controller.on_output(generation, &data) {
                        let captured_at = Utc::now();
                        self.run(
                            &myself,
                            state,
                            LifecycleEvent::TranscriptCaptured { text, captured_at },
                        )
                        .await;
                    }
                }
                ChannelEvent::Closed { reason } => {
                    if state.controller.on_closed(generation) {
                        tracing::warn!(generation, %reason, "channel closed");
                        self.run(&myself, state, LifecycleEvent::ChannelLost { reason })
                            .await;
                    }
                }
            },
            SessionMsg::TimerFired(token) => {
                state.timers.remove(&token);
                self.run(&myself, state, LifecycleEvent::TimerFired(token))
                    .await;
            }
            SessionMsg::Lifecycle(event) => {
                self.run(&myself, state, event).await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.controller.detach();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        state.reporter.abort();
        tracing::info!(actor_id = %myself.get_id(), "SessionActor stopped");
        Ok(())
    }
}

impl SessionActor {
    /// Feed `event` to the machine and perform its effects. Effects that
    /// fail synchronously produce follow-up events, handled in turn.
    async fn run(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &mut SessionState,
        event: LifecycleEvent,
    ) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in state.lifecycle.handle(event) {
                if let Some(follow_up) = self.perform(myself, state, effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(
        &self,
        myself: &ActorRef<SessionMsg>,
        state: &mut SessionState,
        effect: Effect,
    ) -> Option<LifecycleEvent> {
        match effect {
            Effect::ArmTimer { token, after } => {
                let timer = myself.send_after(after, move || SessionMsg::TimerFired(token));
                state.timers.insert(token, timer);
            }
            Effect::CancelTimer { token } => {
                if let Some(timer) = state.timers.remove(&token) {
                    timer.abort();
                }
            }
            Effect::OpenChannel { port } => {
                let actor = myself.clone();
                let attached = state
                    .controller
                    .attach(port, move |generation, event| {
                        let _ = actor.cast(SessionMsg::Channel { generation, event });
                    })
                    .await;
                if let Err(e) = attached {
                    tracing::warn!(port, error = %e, "could not open sandbox channel");
                    return Some(LifecycleEvent::ChannelLost {
                        reason: e.to_string(),
                    });
                }
            }
            Effect::CloseChannel => state.controller.detach(),
            Effect::ReportTranscript(event) => {
                tracing::debug!(
                    task_session_id = %event.task_session_id,
                    bytes = event.text.len(),
                    "reporting command transcript"
                );
                if state.reports.send(event).is_err() {
                    tracing::error!("transcript reporter is gone");
                }
            }
            Effect::RequestReset {
                task_session_id,
                epoch,
            } => {
                let backend = state.backend.clone();
                let actor = myself.clone();
                tokio::spawn(async move {
                    let event = match backend.reset_file_system(&task_session_id).await {
                        Ok(response) => LifecycleEvent::ResetCompleted { epoch, response },
                        Err(e) => LifecycleEvent::ResetFailed {
                            epoch,
                            error: e.to_string(),
                        },
                    };
                    let _ = actor.cast(SessionMsg::Lifecycle(event));
                });
            }
            Effect::RequestNextTask {
                task_session_id,
                reason,
            } => {
                let backend = state.backend.clone();
                let actor = myself.clone();
                tokio::spawn(async move {
                    let event = match backend.go_to_next_task(&task_session_id, reason).await {
                        Ok(response) => LifecycleEvent::NextTask(response),
                        Err(e) => LifecycleEvent::NextTaskFailed {
                            error: e.to_string(),
                        },
                    };
                    let _ = actor.cast(SessionMsg::Lifecycle(event));
                });
            }
            Effect::LoadTaskInfo { task_session_id } => {
                let backend = state.backend.clone();
                let actor = myself.clone();
                tokio::spawn(async move {
                    let event = match backend.additional_task_info(&task_session_id).await {
                        Ok(info) => LifecycleEvent::TaskInfoLoaded {
                            task_session_id,
                            info,
                        },
                        Err(e) => LifecycleEvent::TaskInfoFailed {
                            task_session_id,
                            error: e.to_string(),
                        },
                    };
                    let _ = actor.cast(SessionMsg::Lifecycle(event));
                });
            }
            Effect::Notify(notice) => {
                tracing::info!(%notice, "session notice");
                let _ = state.notices.send(notice);
            }
        }
        None
    }
}

/// Transcripts are reported one at a time, in capture order.
fn spawn_reporter(
    backend: Arc<dyn TaskBackend>,
    actor: ActorRef<SessionMsg>,
) -> (mpsc::UnboundedSender<TranscriptEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TranscriptEvent>();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let TranscriptEvent {
                task_session_id,
                text,
                ..
            } = event;
            let lifecycle = match backend.on_command_execution(&task_session_id, &text).await {
                Ok(result) => LifecycleEvent::TranscriptResult {
                    task_session_id,
                    result,
                },
                Err(e) => LifecycleEvent::TranscriptFailed {
                    task_session_id,
                    error: e.to_string(),
                },
            };
            if actor.cast(SessionMsg::Lifecycle(lifecycle)).is_err() {
                break;
            }
        }
    });
    (tx, reporter)
}
