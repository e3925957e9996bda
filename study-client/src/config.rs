use std::time::Duration;

use shared_types::Stage;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the task-orchestration backend
    pub backend_url: String,
    /// Client-facing relay base, e.g. `ws://localhost:10412`
    pub relay_url: String,
    /// Study session cookie
    pub session_id: String,
    /// Task session to start with
    pub task_session_id: String,
    /// Stage the first task session belongs to
    pub stage: Stage,
    /// User name shown in the sandbox prompt
    pub prompt_user: String,
    /// Length of the sandbox host id in the prompt
    pub prompt_host_id_len: usize,
    pub channel_connect_timeout: Duration,
    pub backend_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            backend_url: env_str("STUDY_BACKEND_URL", "http://127.0.0.1:8000"),
            relay_url: env_str("STUDY_RELAY_URL", "ws://127.0.0.1:10412"),
            session_id: env_required("STUDY_SESSION_ID")?,
            task_session_id: env_required("STUDY_TASK_SESSION_ID")?,
            stage: env_parse("STUDY_STAGE", Stage::TrainingPhase1)?,
            prompt_user: env_str("STUDY_PROMPT_USER", "study_participant"),
            prompt_host_id_len: env_parse("STUDY_PROMPT_HOST_ID_LEN", 12)?,
            channel_connect_timeout: Duration::from_millis(env_parse(
                "STUDY_CHANNEL_CONNECT_TIMEOUT_MS",
                5000,
            )?),
            backend_timeout: Duration::from_millis(env_parse("STUDY_BACKEND_TIMEOUT_MS", 30_000)?),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var {key}"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
