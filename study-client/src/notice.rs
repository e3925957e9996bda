use std::fmt;
use std::time::Duration;

use shared_types::{Stage, StudyReport};

/// Presentation events for whatever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    SessionStarted {
        task_session_id: String,
        stage: Stage,
        /// `None` for untimed training tasks
        time_budget: Option<Duration>,
    },
    FilesystemDiff {
        filesystem_diff: serde_json::Value,
        stdout_diff: Option<serde_json::Value>,
    },
    TaskCompleted,
    TimedOut,
    Quit,
    ResetStarted,
    ResetComplete {
        port: u16,
    },
    ConnectionLost {
        reason: String,
    },
    SandboxUnavailable,
    StageTransition {
        stage: Stage,
    },
    StudyComplete(StudyReport),
    BackendError {
        message: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SessionStarted {
                task_session_id,
                stage,
                time_budget: Some(budget),
            } => write!(
                f,
                "task {task_session_id} started ({stage}, {}s)",
                budget.as_secs()
            ),
            Notice::SessionStarted {
                task_session_id,
                stage,
                time_budget: None,
            } => write!(f, "task {task_session_id} started ({stage}, untimed)"),
            Notice::FilesystemDiff { .. } => write!(f, "filesystem updated"),
            Notice::TaskCompleted => write!(f, "task completed"),
            Notice::TimedOut => write!(f, "time is up"),
            Notice::Quit => write!(f, "task given up"),
            Notice::ResetStarted => write!(f, "resetting sandbox"),
            Notice::ResetComplete { port } => write!(f, "sandbox reset (port {port})"),
            Notice::ConnectionLost { reason } => {
                write!(f, "connection to the sandbox lost ({reason}); reset to reconnect")
            }
            Notice::SandboxUnavailable => {
                write!(f, "the sandbox filesystem is not ready; reset to try again")
            }
            Notice::StageTransition { stage } => {
                write!(f, "entering {stage}; tool availability changes from here on")
            }
            Notice::StudyComplete(report) => write!(
                f,
                "study complete: {} of {} tasks passed, {} given up",
                report.num_passed, report.num_total, report.num_given_up
            ),
            Notice::BackendError { message } => write!(f, "backend error: {message}"),
        }
    }
}
