//! Task-orchestration backend client
//!
//! Four endpoints, all scoped by the `session_id` and `task_session_id`
//! cookies:
//! - `GET  /get_additional_task_info`
//! - `POST /on_command_execution` (form field `stdout`)
//! - `GET  /reset_file_system`
//! - `GET  /go_to_next_task?reason_for_close=<passed|quit|time_out>`

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shared_types::{CloseReason, CommandResult, NextTaskResponse, ResetResponse, TaskInfo};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} answered HTTP {status}")]
    Status {
        endpoint: &'static str,
        status: u16,
    },

    #[error("could not decode {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn additional_task_info(&self, task_session_id: &str) -> Result<TaskInfo, BackendError>;

    /// Report one command transcript.
    async fn on_command_execution(
        &self,
        task_session_id: &str,
        transcript: &str,
    ) -> Result<CommandResult, BackendError>;

    async fn reset_file_system(&self, task_session_id: &str) -> Result<ResetResponse, BackendError>;

    /// Close the task session and ask for the next one.
    async fn go_to_next_task(
        &self,
        task_session_id: &str,
        reason: CloseReason,
    ) -> Result<NextTaskResponse, BackendError>;
}

// ============================================================================
// HTTP Backend
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| BackendError::Http {
                endpoint: "client",
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    fn cookie(&self, task_session_id: &str) -> String {
        format!(
            "session_id={}; task_session_id={task_session_id}",
            self.session_id
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
        task_session_id: &str,
    ) -> Result<T, BackendError> {
        let response = request
            .header(reqwest::header::COOKIE, self.cookie(task_session_id))
            .send()
            .await
            .map_err(|source| BackendError::Http { endpoint, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|source| BackendError::Decode { endpoint, source })
    }
}

#[async_trait]
impl TaskBackend for HttpBackend {
    async fn additional_task_info(&self, task_session_id: &str) -> Result<TaskInfo, BackendError> {
        const ENDPOINT: &str = "get_additional_task_info";
        let request = self.client.get(self.url(ENDPOINT));
        self.send(ENDPOINT, request, task_session_id).await
    }

    async fn on_command_execution(
        &self,
        task_session_id: &str,
        transcript: &str,
    ) -> Result<CommandResult, BackendError> {
        const ENDPOINT: &str = "on_command_execution";
        let request = self
            .client
            .post(self.url(ENDPOINT))
            .form(&[("stdout", transcript)]);
        self.send(ENDPOINT, request, task_session_id).await
    }

    async fn reset_file_system(&self, task_session_id: &str) -> Result<ResetResponse, BackendError> {
        const ENDPOINT: &str = "reset_file_system";
        let request = self.client.get(self.url(ENDPOINT));
        self.send(ENDPOINT, request, task_session_id).await
    }

    async fn go_to_next_task(
        &self,
        task_session_id: &str,
        reason: CloseReason,
    ) -> Result<NextTaskResponse, BackendError> {
        const ENDPOINT: &str = "go_to_next_task";
        let request = self
            .client
            .get(self.url(ENDPOINT))
            .query(&[("reason_for_close", reason.as_str())]);
        self.send(ENDPOINT, request, task_session_id).await
    }
}
