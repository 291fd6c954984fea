use std::path::PathBuf;
use thiserror::Error;

/// Failure to bring up the external transcoder process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("transcoder binary not found or not executable: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("failed to spawn transcoder process: {0}")]
    SpawnFailed(#[source] std::io::Error),
}

/// Errors surfaced by lifecycle operations. Every variant maps to a
/// structured API response; none of them takes the supervisor down.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(
        "stream '{id}' already running{}",
        .pid.map(|p| format!(" (PID: {p})")).unwrap_or_default()
    )]
    AlreadyRunning { id: String, pid: Option<u32> },

    #[error("stream '{id}' not found")]
    NotFound { id: String },

    #[error("invalid stream spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("stream '{id}' (PID: {pid}) did not exit after kill; left in Stopping state")]
    TerminationTimeout { id: String, pid: u32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
