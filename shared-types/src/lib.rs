//! Shared types between the relay, the shell host and the study client
//!
//! These types cover:
//! - channel addressing (`scheme://<host>:<relay-port>/<sandbox-port>`)
//! - the task-orchestration backend's JSON responses
//! - the study stage model
//!
//! Serializable with serde for JSON over HTTP

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Channel Addressing
// ============================================================================

/// Why a channel path could not be turned into a sandbox port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("channel path has no sandbox port segment")]
    Empty,

    #[error("sandbox port segment '{0}' is not a non-negative integer")]
    NotNumeric(String),

    #[error("sandbox port segment '{0}' is out of range")]
    OutOfRange(String),
}

/// A parsed client channel path: the sandbox port plus whatever path
/// followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoute {
    pub port: u16,
    /// Remaining path, always starting with `/`.
    pub rest: String,
}

/// Parse the first path segment of a channel request as the sandbox port.
///
/// Only ASCII digits are accepted, so `-1` and `+80` are rejected rather
/// than coerced.
pub fn parse_sandbox_route(path: &str) -> Result<SandboxRoute, RouteError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (segment, rest) = match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    };

    if segment.is_empty() {
        return Err(RouteError::Empty);
    }
    if !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RouteError::NotNumeric(segment.to_string()));
    }
    let port = segment
        .parse::<u16>()
        .map_err(|_| RouteError::OutOfRange(segment.to_string()))?;

    let rest = if rest.is_empty() { "/" } else { rest };
    Ok(SandboxRoute {
        port,
        rest: rest.to_string(),
    })
}

/// Build the client-facing channel URL for `port` behind `relay_base`
/// (e.g. `ws://relay.example:10412`).
pub fn channel_url(relay_base: &str, port: u16) -> String {
    format!("{}/{port}", relay_base.trim_end_matches('/'))
}

// ============================================================================
// Study Stages
// ============================================================================

/// A phase of the study protocol. Each stage has its own tool-availability
/// policy and time budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    #[serde(rename = "training-phase-1")]
    TrainingPhase1,
    #[serde(rename = "training-phase-2")]
    TrainingPhase2,
    #[serde(rename = "main-phase-A")]
    MainPhaseA,
    #[serde(rename = "main-phase-B")]
    MainPhaseB,
}

impl Stage {
    /// Training stages run untimed.
    pub fn is_training(self) -> bool {
        matches!(self, Stage::TrainingPhase1 | Stage::TrainingPhase2)
    }

    /// Stage of the session that follows a session in `self`, absent a
    /// stage-transition notice from the backend.
    pub fn successor(self) -> Stage {
        match self {
            Stage::TrainingPhase1 => Stage::MainPhaseA,
            Stage::TrainingPhase2 => Stage::MainPhaseB,
            other => other,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::TrainingPhase1 => write!(f, "training-phase-1"),
            Stage::TrainingPhase2 => write!(f, "training-phase-2"),
            Stage::MainPhaseA => write!(f, "main-phase-A"),
            Stage::MainPhaseB => write!(f, "main-phase-B"),
        }
    }
}

/// Unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown study stage '{0}'")]
pub struct UnknownStage(pub String);

impl std::str::FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training-phase-1" => Ok(Stage::TrainingPhase1),
            "training-phase-2" => Ok(Stage::TrainingPhase2),
            "main-phase-A" => Ok(Stage::MainPhaseA),
            "main-phase-B" => Ok(Stage::MainPhaseB),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

// ============================================================================
// Backend Contract
// ============================================================================

/// Whether the sandbox filesystem was provisioned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilesystemStatus {
    #[serde(rename = "FILE_SYSTEM_WRITTEN_TO_DISK")]
    WrittenToDisk,
    #[serde(rename = "FILE_SYSTEM_ERROR")]
    Error,
    #[serde(other)]
    Unknown,
}

impl FilesystemStatus {
    pub fn is_ready(self) -> bool {
        self == FilesystemStatus::WrittenToDisk
    }
}

/// Response of `get_additional_task_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub container_port: u16,
    pub filesystem_status: FilesystemStatus,
    #[serde(default)]
    pub task_id: Option<u32>,
    /// Full budget of a fresh task, in seconds.
    #[serde(default)]
    pub task_duration: Option<u64>,
    /// Remaining budget of a resumed task, in seconds.
    #[serde(default)]
    pub time_left: Option<u64>,
    #[serde(default)]
    pub current_filesystem: Option<serde_json::Value>,
    #[serde(default)]
    pub goal_filesystem: Option<serde_json::Value>,
    #[serde(default)]
    pub page_tour: Option<serde_json::Value>,
    #[serde(default)]
    pub treatment_order: Option<serde_json::Value>,
}

impl TaskInfo {
    /// Time budget for the session; a resumed `time_left` wins over the
    /// task's nominal duration.
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_left
            .or(self.task_duration)
            .map(Duration::from_secs)
    }
}

/// Outcome of a transcript report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandStatus {
    Running,
    TaskCompleted,
    FilesystemError,
}

impl From<String> for CommandStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "TASK_COMPLETED" => CommandStatus::TaskCompleted,
            "FILE_SYSTEM_ERROR" => CommandStatus::FilesystemError,
            // "RUNNING" and the backend's generic "SUCCESS"
            _ => CommandStatus::Running,
        }
    }
}

impl From<CommandStatus> for String {
    fn from(value: CommandStatus) -> Self {
        match value {
            CommandStatus::Running => "RUNNING",
            CommandStatus::TaskCompleted => "TASK_COMPLETED",
            CommandStatus::FilesystemError => "FILE_SYSTEM_ERROR",
        }
        .to_string()
    }
}

/// Response of `on_command_execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    #[serde(default)]
    pub filesystem_diff: serde_json::Value,
    #[serde(default)]
    pub stdout_diff: Option<serde_json::Value>,
}

/// Response of `reset_file_system`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub container_port: u16,
    pub filesystem_status: FilesystemStatus,
    #[serde(default)]
    pub current_filesystem: Option<serde_json::Value>,
    #[serde(default)]
    pub filesystem_diff: Option<serde_json::Value>,
    #[serde(default)]
    pub stdout_diff: Option<serde_json::Value>,
}

/// Why the current task session is being closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Passed,
    Quit,
    TimeOut,
}

impl CloseReason {
    /// Value of the `reason_for_close` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Passed => "passed",
            CloseReason::Quit => "quit",
            CloseReason::TimeOut => "time_out",
        }
    }
}

pub const STATUS_ENTERING_STAGE_I: &str = "ENTERING_STAGE_I";
pub const STATUS_ENTERING_STAGE_II: &str = "ENTERING_STAGE_II";
pub const STATUS_STUDY_SESSION_COMPLETE: &str = "STUDY_SESSION_COMPLETE";
pub const STATUS_TASK_SESSION_CREATION_FAILED: &str = "TASK_SESSION_CREATION_FAILED";

/// Raw response of `go_to_next_task`. Use [`NextTaskResponse::outcome`] to
/// interpret it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextTaskResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub task_session_id: Option<String>,
    #[serde(default)]
    pub treatment_order: Option<serde_json::Value>,
    #[serde(default)]
    pub num_passed: Option<u32>,
    #[serde(default)]
    pub num_total: Option<u32>,
    #[serde(default)]
    pub num_given_up: Option<u32>,
}

/// Final tallies reported when the study completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyReport {
    pub num_passed: u32,
    pub num_total: u32,
    pub num_given_up: u32,
}

/// Interpreted `go_to_next_task` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextTask {
    /// Resume with a new task session in the current stage.
    Session { task_session_id: String },
    /// Show the tool-availability notice, then resume in `stage`.
    EnteringStage {
        stage: Stage,
        task_session_id: Option<String>,
    },
    StudyComplete(StudyReport),
    CreationFailed,
}

impl NextTaskResponse {
    pub fn outcome(&self) -> NextTask {
        match self.status.as_str() {
            STATUS_ENTERING_STAGE_I => NextTask::EnteringStage {
                stage: Stage::TrainingPhase1,
                task_session_id: self.task_session_id.clone(),
            },
            STATUS_ENTERING_STAGE_II => NextTask::EnteringStage {
                stage: Stage::TrainingPhase2,
                task_session_id: self.task_session_id.clone(),
            },
            STATUS_STUDY_SESSION_COMPLETE => NextTask::StudyComplete(StudyReport {
                num_passed: self.num_passed.unwrap_or(0),
                num_total: self.num_total.unwrap_or(0),
                num_given_up: self.num_given_up.unwrap_or(0),
            }),
            STATUS_TASK_SESSION_CREATION_FAILED => NextTask::CreationFailed,
            status => match &self.task_session_id {
                Some(id) if !id.is_empty() => NextTask::Session {
                    task_session_id: id.clone(),
                },
                // Some deployments put the next session id in `status` itself.
                _ if !status.is_empty() && !status.ends_with("_COMPLETE") => NextTask::Session {
                    task_session_id: status.to_string(),
                },
                _ => NextTask::CreationFailed,
            },
        }
    }
}

// ============================================================================
// Transcripts
// ============================================================================

/// Snapshot of terminal output between two prompt boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub task_session_id: String,
    pub text: String,
    pub captured_at: DateTime<Utc>,
}
