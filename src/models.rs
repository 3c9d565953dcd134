//! Typed request, result, and record models shared by the executor and
//! the process registry. The protocol layer serializes these with serde;
//! the field names here are the wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a tracked background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
    Unknown,
}

impl ProcessStatus {
    /// Terminal states are stable until the record is cleaned up.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Killed
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Killed => "killed",
            ProcessStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single command execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command text, handed to the shell verbatim.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    /// Timeout in seconds. Zero is accepted but expires immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default = "default_capture")]
    pub capture_output: bool,
}

fn default_capture() -> bool {
    true
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_directory: None,
            environment_variables: HashMap::new(),
            timeout: None,
            capture_output: true,
        }
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment_variables
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.environment_variables
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

/// Outcome of a single command execution.
///
/// Blocking executions produce this in one step. Streaming executions hand
/// out a preliminary result behind a shared cell which the completion task
/// finalizes in place once the process exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    /// The process's own exit code, a negated signal number if it died to
    /// a signal, or -1 when the framework itself failed the execution.
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Output fragments in delivery order, present only for streaming
    /// executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_chunks: Option<Vec<String>>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Placeholder result handed out at spawn time for streaming calls,
    /// finalized in place by the completion task.
    pub(crate) fn preliminary(command: &str, started_at: DateTime<Utc>, track_chunks: bool) -> Self {
        Self {
            command: command.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            execution_time: 0.0,
            started_at,
            completed_at: started_at,
            captured_chunks: track_chunks.then(Vec::new),
        }
    }
}

/// Public shape of a tracked background process.
///
/// The registry owns these; the live child handle and any output buffer
/// are associated with the record internally but are not part of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// OS pid.
    pub pid: u32,
    /// Opaque generated identifier, distinct from the OS pid.
    pub process_id: String,
    pub command: String,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_fields() {
        let request = CommandRequest::new("echo hi")
            .working_directory("/tmp")
            .env("FOO", "bar")
            .timeout(30)
            .capture_output(false);

        assert_eq!(request.command, "echo hi");
        assert_eq!(request.working_directory, Some(PathBuf::from("/tmp")));
        assert_eq!(
            request.environment_variables.get("FOO").map(String::as_str),
            Some("bar")
        );
        assert_eq!(request.timeout, Some(30));
        assert!(!request.capture_output);
    }

    #[test]
    fn request_capture_defaults_to_true() {
        let request: CommandRequest = serde_json::from_str(r#"{"command": "ls"}"#).unwrap();
        assert!(request.capture_output);
        assert!(request.environment_variables.is_empty());
        assert!(request.timeout.is_none());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Killed).unwrap(),
            "\"killed\""
        );
        assert_eq!(ProcessStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn terminal_states() {
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(!ProcessStatus::Unknown.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::Killed.is_terminal());
    }

    #[test]
    fn result_wire_shape() {
        let started = Utc::now();
        let result = CommandResult {
            command: "true".to_string(),
            exit_code: 0,
            stdout: "out".to_string(),
            stderr: String::new(),
            execution_time: 0.01,
            started_at: started,
            completed_at: started,
            captured_chunks: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["command"], "true");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["stdout"], "out");
        assert!(json.get("captured_chunks").is_none());
    }

    #[test]
    fn preliminary_result_tracks_chunks_only_when_asked() {
        let now = Utc::now();
        let streaming = CommandResult::preliminary("ls", now, true);
        assert_eq!(streaming.captured_chunks, Some(Vec::new()));
        assert_eq!(streaming.exit_code, -1);

        let plain = CommandResult::preliminary("ls", now, false);
        assert!(plain.captured_chunks.is_none());
    }
}
