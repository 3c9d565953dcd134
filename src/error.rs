use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for command execution and process supervision.
///
/// Most variants never surface to callers directly: the executor converts
/// them into a populated `CommandResult` with the `-1` sentinel exit code,
/// and the registry converts them into a `bool` or a `NotFound` value.
/// Only `Config` escapes at construction time.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Working directory error: {message}")]
    Validation { message: String },

    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to terminate process: {message}")]
    Termination { message: String },

    #[error("Output encoding error: {message}")]
    Encoding { message: String },

    #[error("Output limit exceeded: {message}")]
    ResourceLimit { message: String },

    #[error("Process {process_id} not found")]
    NotFound { process_id: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Human-readable cause placed on the stderr of a failure result.
    pub fn stderr_text(&self) -> String {
        match self {
            ExecError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                format!("Command not found: {source}")
            }
            ExecError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                format!("Permission denied: {source}")
            }
            other => other.to_string(),
        }
    }
}
