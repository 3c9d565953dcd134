use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Construction-time settings for the executor and the process registry.
///
/// These are plain values supplied by whoever wires the components up;
/// this crate knows nothing about configuration file formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Directory commands run in when a request does not name one.
    pub default_working_directory: Option<PathBuf>,
    /// Timeout in seconds applied when a request does not carry one.
    pub default_timeout: Option<u64>,
    /// Bytes read per pull from a subprocess pipe. Must be positive.
    pub buffer_size: usize,
    /// Per-stream output ceiling in bytes before truncation kicks in.
    pub max_output_size: usize,
    /// Grace window between SIGTERM and SIGKILL when terminating a
    /// process group.
    #[serde(with = "humantime_serde", default = "default_kill_grace")]
    pub kill_grace: Duration,
}

const DEFAULT_BUFFER_SIZE: usize = 8192;
const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

fn default_kill_grace() -> Duration {
    Duration::from_millis(100)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_working_directory: None,
            default_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            kill_grace: default_kill_grace(),
        }
    }
}
