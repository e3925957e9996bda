//! Task lifecycle state machine
//!
//! ```text
//! Idle → Running → {Completed, TimedOut, QuitRequested} → AwaitingNext
//!      → Running | StageTransition → … | StudyComplete
//! ```
//!
//! [`TaskLifecycle::handle`] is the single entry point: it takes one event,
//! updates the machine and returns the effects to perform, in order. It
//! never does I/O itself. Completions of effects come back as events.
//!
//! Stale completions are recognised rather than cancelled: timers carry a
//! [`TimerToken`], reset requests carry an epoch, and only the latest of
//! each is honoured.

use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_types::{
    CloseReason, CommandResult, CommandStatus, NextTask, NextTaskResponse, ResetResponse, Stage,
    TaskInfo, TranscriptEvent,
};
use tracing::{debug, warn};

use crate::notice::Notice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Completed,
    TimedOut,
    QuitRequested,
    AwaitingNext,
    StageTransition(Stage),
    StudyComplete,
}

/// One task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub task_session_id: String,
    pub sandbox_port: u16,
    pub task_id: Option<u32>,
    pub stage: Stage,
    /// `None` means untimed
    pub time_budget: Option<Duration>,
    pub sandbox_ready: bool,
    pub terminated: bool,
}

impl Session {
    pub fn from_task_info(task_session_id: impl Into<String>, stage: Stage, info: &TaskInfo) -> Self {
        Self {
            task_session_id: task_session_id.into(),
            sandbox_port: info.container_port,
            task_id: info.task_id,
            stage,
            time_budget: if stage.is_training() {
                None
            } else {
                info.time_budget()
            },
            sandbox_ready: info.filesystem_status.is_ready(),
            terminated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The backend handed out a task session; its details still need loading.
    Assigned {
        task_session_id: String,
        stage: Stage,
    },
    TaskInfoLoaded {
        task_session_id: String,
        info: TaskInfo,
    },
    TaskInfoFailed {
        task_session_id: String,
        error: String,
    },
    Start(Session),
    TranscriptCaptured {
        text: String,
        captured_at: DateTime<Utc>,
    },
    TranscriptResult {
        task_session_id: String,
        result: CommandResult,
    },
    TranscriptFailed {
        task_session_id: String,
        error: String,
    },
    TimerFired(TimerToken),
    ResetRequested,
    ResetCompleted {
        epoch: u64,
        response: ResetResponse,
    },
    ResetFailed {
        epoch: u64,
        error: String,
    },
    QuitConfirmed,
    Advance,
    NextTask(NextTaskResponse),
    NextTaskFailed {
        error: String,
    },
    StageAcknowledged,
    ChannelLost {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ArmTimer { token: TimerToken, after: Duration },
    CancelTimer { token: TimerToken },
    OpenChannel { port: u16 },
    CloseChannel,
    ReportTranscript(TranscriptEvent),
    RequestReset { task_session_id: String, epoch: u64 },
    RequestNextTask { task_session_id: String, reason: CloseReason },
    LoadTaskInfo { task_session_id: String },
    Notify(Notice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub phase: Phase,
    pub session: Option<Session>,
    pub channel_open: bool,
    pub reset_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingSession {
    task_session_id: String,
    stage: Stage,
}

#[derive(Debug)]
pub struct TaskLifecycle {
    phase: Phase,
    stage: Stage,
    session: Option<Session>,
    pending: Option<PendingSession>,
    timer: Option<TimerToken>,
    next_timer: u64,
    channel_open: bool,
    reset_epoch: u64,
    reset_in_flight: Option<u64>,
    close_reason: Option<CloseReason>,
    next_in_flight: bool,
    task_info_in_flight: bool,
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stage: Stage::TrainingPhase1,
            session: None,
            pending: None,
            timer: None,
            next_timer: 0,
            channel_open: false,
            reset_epoch: 0,
            reset_in_flight: None,
            close_reason: None,
            next_in_flight: false,
            task_info_in_flight: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            session: self.session.clone(),
            channel_open: self.channel_open,
            reset_in_flight: self.reset_in_flight.is_some(),
        }
    }

    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<Effect> {
        match event {
            LifecycleEvent::Assigned {
                task_session_id,
                stage,
            } => self.assign(task_session_id, stage),
            LifecycleEvent::TaskInfoLoaded {
                task_session_id,
                info,
            } => self.task_info_loaded(task_session_id, info),
            LifecycleEvent::TaskInfoFailed {
                task_session_id,
                error,
            } => {
                if self.is_pending(&task_session_id) {
                    self.task_info_in_flight = false;
                    vec![backend_error(format!("could not load task {task_session_id}: {error}"))]
                } else {
                    Vec::new()
                }
            }
            LifecycleEvent::Start(session) => self.start(session),
            LifecycleEvent::TranscriptCaptured { text, captured_at } => {
                self.transcript_captured(text, captured_at)
            }
            LifecycleEvent::TranscriptResult {
                task_session_id,
                result,
            } => self.transcript_result(task_session_id, result),
            LifecycleEvent::TranscriptFailed {
                task_session_id,
                error,
            } => {
                if self.is_current(&task_session_id) {
                    vec![backend_error(format!("command report failed: {error}"))]
                } else {
                    Vec::new()
                }
            }
            LifecycleEvent::TimerFired(token) => self.timer_fired(token),
            LifecycleEvent::ResetRequested => self.reset_requested(),
            LifecycleEvent::ResetCompleted { epoch, response } => {
                self.reset_completed(epoch, response)
            }
            LifecycleEvent::ResetFailed { epoch, error } => {
                if self.phase == Phase::Running && self.reset_in_flight == Some(epoch) {
                    self.reset_in_flight = None;
                    vec![backend_error(format!("sandbox reset failed: {error}"))]
                } else {
                    Vec::new()
                }
            }
            LifecycleEvent::QuitConfirmed => {
                if self.phase != Phase::Running {
                    return Vec::new();
                }
                let mut effects = self.leave_running(Phase::QuitRequested);
                effects.push(Effect::Notify(Notice::Quit));
                effects
            }
            LifecycleEvent::Advance => self.advance(),
            LifecycleEvent::NextTask(response) => self.next_task(response),
            LifecycleEvent::NextTaskFailed { error } => {
                if self.phase == Phase::AwaitingNext && self.next_in_flight {
                    self.next_in_flight = false;
                    vec![backend_error(format!("could not get the next task: {error}"))]
                } else {
                    Vec::new()
                }
            }
            LifecycleEvent::StageAcknowledged => self.stage_acknowledged(),
            LifecycleEvent::ChannelLost { reason } => {
                if self.phase == Phase::Running && self.channel_open {
                    self.channel_open = false;
                    vec![Effect::Notify(Notice::ConnectionLost { reason })]
                } else {
                    Vec::new()
                }
            }
        }
    }

    // ========================================================================
    // Session start
    // ========================================================================

    fn assign(&mut self, task_session_id: String, stage: Stage) -> Vec<Effect> {
        if !matches!(self.phase, Phase::Idle | Phase::AwaitingNext) {
            warn!(phase = ?self.phase, %task_session_id, "ignoring task assignment");
            return Vec::new();
        }
        self.stage = stage;
        self.pending = Some(PendingSession {
            task_session_id,
            stage,
        });
        self.load_pending()
    }

    fn load_pending(&mut self) -> Vec<Effect> {
        let Some(pending) = &self.pending else {
            return Vec::new();
        };
        self.task_info_in_flight = true;
        vec![Effect::LoadTaskInfo {
            task_session_id: pending.task_session_id.clone(),
        }]
    }

    fn task_info_loaded(&mut self, task_session_id: String, info: TaskInfo) -> Vec<Effect> {
        if !self.is_pending(&task_session_id) {
            debug!(%task_session_id, "dropping task info for a session that is not pending");
            return Vec::new();
        }
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        self.task_info_in_flight = false;
        let session = Session::from_task_info(pending.task_session_id, pending.stage, &info);
        self.start(session)
    }

    fn start(&mut self, session: Session) -> Vec<Effect> {
        if matches!(self.phase, Phase::Running | Phase::StudyComplete) {
            warn!(phase = ?self.phase, "cannot start a session now");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let Some(token) = self.timer.take() {
            effects.push(Effect::CancelTimer { token });
        }
        if self.channel_open {
            self.channel_open = false;
            effects.push(Effect::CloseChannel);
        }

        self.phase = Phase::Running;
        self.stage = session.stage;
        self.pending = None;
        self.reset_in_flight = None;
        self.close_reason = None;
        self.next_in_flight = false;
        self.task_info_in_flight = false;

        if !session.stage.is_training() {
            if let Some(after) = session.time_budget {
                let token = self.next_token();
                self.timer = Some(token);
                effects.push(Effect::ArmTimer { token, after });
            }
        }

        effects.push(Effect::Notify(Notice::SessionStarted {
            task_session_id: session.task_session_id.clone(),
            stage: session.stage,
            time_budget: self.timer.and(session.time_budget),
        }));

        if session.sandbox_ready {
            self.channel_open = true;
            effects.push(Effect::OpenChannel {
                port: session.sandbox_port,
            });
        } else {
            effects.push(Effect::Notify(Notice::SandboxUnavailable));
        }

        self.session = Some(session);
        effects
    }

    // ========================================================================
    // Running
    // ========================================================================

    fn transcript_captured(&mut self, text: String, captured_at: DateTime<Utc>) -> Vec<Effect> {
        match (&self.phase, &self.session) {
            (Phase::Running, Some(session)) => vec![Effect::ReportTranscript(TranscriptEvent {
                task_session_id: session.task_session_id.clone(),
                text,
                captured_at,
            })],
            _ => {
                debug!(phase = ?self.phase, "dropping transcript outside a running session");
                Vec::new()
            }
        }
    }

    fn transcript_result(&mut self, task_session_id: String, result: CommandResult) -> Vec<Effect> {
        if !self.is_current(&task_session_id) {
            debug!(%task_session_id, "dropping command result for another session");
            return Vec::new();
        }

        if result.status == CommandStatus::FilesystemError {
            return vec![Effect::Notify(Notice::SandboxUnavailable)];
        }

        let mut effects = vec![Effect::Notify(Notice::FilesystemDiff {
            filesystem_diff: result.filesystem_diff,
            stdout_diff: result.stdout_diff,
        })];
        if result.status == CommandStatus::TaskCompleted && self.phase == Phase::Running {
            effects.extend(self.leave_running(Phase::Completed));
            effects.push(Effect::Notify(Notice::TaskCompleted));
        }
        effects
    }

    fn timer_fired(&mut self, token: TimerToken) -> Vec<Effect> {
        if self.phase != Phase::Running || self.timer != Some(token) {
            debug!(?token, phase = ?self.phase, "ignoring stale timer");
            return Vec::new();
        }
        self.timer = None;
        let mut effects = self.leave_running(Phase::TimedOut);
        effects.push(Effect::Notify(Notice::TimedOut));
        effects
    }

    fn reset_requested(&mut self) -> Vec<Effect> {
        let task_session_id = match (&self.phase, &self.session) {
            (Phase::Running, Some(session)) => session.task_session_id.clone(),
            _ => return Vec::new(),
        };

        let mut effects = Vec::new();
        if self.channel_open {
            self.channel_open = false;
            effects.push(Effect::CloseChannel);
        }
        self.reset_epoch += 1;
        self.reset_in_flight = Some(self.reset_epoch);
        effects.push(Effect::RequestReset {
            task_session_id,
            epoch: self.reset_epoch,
        });
        effects.push(Effect::Notify(Notice::ResetStarted));
        effects
    }

    fn reset_completed(&mut self, epoch: u64, response: ResetResponse) -> Vec<Effect> {
        if self.phase != Phase::Running || self.reset_in_flight != Some(epoch) {
            debug!(epoch, "ignoring superseded reset response");
            return Vec::new();
        }
        self.reset_in_flight = None;
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.sandbox_port = response.container_port;
        session.sandbox_ready = response.filesystem_status.is_ready();

        let mut effects = Vec::new();
        if !session.sandbox_ready {
            effects.push(Effect::Notify(Notice::SandboxUnavailable));
            return effects;
        }
        if self.channel_open {
            effects.push(Effect::CloseChannel);
        }
        self.channel_open = true;
        effects.push(Effect::OpenChannel {
            port: response.container_port,
        });
        effects.push(Effect::Notify(Notice::ResetComplete {
            port: response.container_port,
        }));
        effects
    }

    /// Every exit from `Running` cancels the timer, then closes the channel.
    fn leave_running(&mut self, next: Phase) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(token) = self.timer.take() {
            effects.push(Effect::CancelTimer { token });
        }
        if self.channel_open {
            self.channel_open = false;
            effects.push(Effect::CloseChannel);
        }
        self.reset_in_flight = None;
        if let Some(session) = self.session.as_mut() {
            session.terminated = true;
        }
        self.phase = next;
        effects
    }

    // ========================================================================
    // Between sessions
    // ========================================================================

    fn advance(&mut self) -> Vec<Effect> {
        let reason = match self.phase {
            Phase::Completed => CloseReason::Passed,
            Phase::TimedOut => CloseReason::TimeOut,
            Phase::QuitRequested => CloseReason::Quit,
            Phase::Idle | Phase::AwaitingNext
                if !self.next_in_flight && !self.task_info_in_flight =>
            {
                return self.retry()
            }
            _ => return Vec::new(),
        };
        self.close_reason = Some(reason);
        self.phase = Phase::AwaitingNext;
        self.request_next_task()
    }

    /// Re-issue whichever request last failed.
    fn retry(&mut self) -> Vec<Effect> {
        if self.pending.is_some() {
            return self.load_pending();
        }
        self.request_next_task()
    }

    fn request_next_task(&mut self) -> Vec<Effect> {
        match (self.close_reason, &self.session) {
            (Some(reason), Some(session)) => {
                self.next_in_flight = true;
                vec![Effect::RequestNextTask {
                    task_session_id: session.task_session_id.clone(),
                    reason,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn next_task(&mut self, response: NextTaskResponse) -> Vec<Effect> {
        if self.phase != Phase::AwaitingNext || !self.next_in_flight {
            debug!(status = %response.status, "ignoring unexpected next-task response");
            return Vec::new();
        }
        self.next_in_flight = false;

        match response.outcome() {
            NextTask::Session { task_session_id } => {
                let stage = self.stage.successor();
                self.assign(task_session_id, stage)
            }
            NextTask::EnteringStage {
                stage,
                task_session_id,
            } => {
                self.phase = Phase::StageTransition(stage);
                self.stage = stage;
                self.pending = task_session_id.map(|task_session_id| PendingSession {
                    task_session_id,
                    stage,
                });
                vec![Effect::Notify(Notice::StageTransition { stage })]
            }
            NextTask::StudyComplete(report) => {
                self.phase = Phase::StudyComplete;
                self.session = None;
                self.pending = None;
                vec![Effect::Notify(Notice::StudyComplete(report))]
            }
            NextTask::CreationFailed => vec![backend_error(
                "the backend could not create the next task session".to_string(),
            )],
        }
    }

    fn stage_acknowledged(&mut self) -> Vec<Effect> {
        let Phase::StageTransition(_) = self.phase else {
            return Vec::new();
        };
        self.phase = Phase::AwaitingNext;
        if self.pending.is_some() {
            self.load_pending()
        } else {
            self.request_next_task()
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn next_token(&mut self) -> TimerToken {
        self.next_timer += 1;
        TimerToken(self.next_timer)
    }

    fn is_pending(&self, task_session_id: &str) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.task_session_id == task_session_id)
    }

    fn is_current(&self, task_session_id: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.task_session_id == task_session_id)
    }
}

fn backend_error(message: String) -> Effect {
    Effect::Notify(Notice::BackendError { message })
}
