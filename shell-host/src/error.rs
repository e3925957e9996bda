use std::path::PathBuf;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ShellHostError {
    #[error("Failed to spawn shell: {0}")]
    ProcessSpawn(String),

    #[error("Working directory {} is not a directory", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("Shell channel closed")]
    ChannelClosed,
}

