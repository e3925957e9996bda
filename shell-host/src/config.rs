use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the shell channel listens on
    pub port: u16,
    /// Shell binary to run on the PTY
    pub shell: String,
    /// Directory the shell starts in
    pub working_dir: PathBuf,
    /// Value of TERM for the shell
    pub term: String,
    /// Upper bound on replayed output for late attachers
    pub backlog_bytes: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let shell = match std::env::var("SHELL_HOST_SHELL") {
            Ok(shell) => shell,
            Err(_) => env_str("SHELL", "/bin/bash"),
        };

        Ok(Self {
            port: env_parse("SHELL_HOST_PORT", 10411)?,
            shell,
            working_dir: PathBuf::from(env_str("SHELL_HOST_WORKDIR", "/home/study_participant")),
            term: env_str("SHELL_HOST_TERM", "xterm-color"),
            backlog_bytes: env_parse("SHELL_HOST_BACKLOG_BYTES", 64 * 1024)?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
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
