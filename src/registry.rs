//! Supervision of detached background processes.
//!
//! Each started command gets an opaque generated id, its own process
//! group, and a record whose status stays queryable and killable
//! independent of any caller awaiting it. All tracking state lives behind
//! an async mutex so concurrent start/kill/list calls interleave safely.

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::ExecError;
use crate::models::{ProcessRecord, ProcessStatus};
use crate::process::{self, Terminator};
use crate::streamer::OutputStreamer;

#[derive(Debug, Default)]
struct OutputBuffer {
    stdout: String,
    stderr: String,
}

struct TrackedProcess {
    record: ProcessRecord,
    capture_output: bool,
    /// Held by the capture task while it reaps the exit status; everyone
    /// else must use `try_lock` and fall back to a liveness probe.
    child: Arc<Mutex<Child>>,
    output: Option<Arc<Mutex<OutputBuffer>>>,
}

/// Tracks and supervises background processes.
pub struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<String, TrackedProcess>>>,
    streamer: OutputStreamer,
    terminator: Arc<dyn Terminator>,
    kill_grace: Duration,
}

impl ProcessRegistry {
    pub fn new(config: &ExecutorConfig) -> Result<Self, ExecError> {
        let streamer = OutputStreamer::new(config.buffer_size, config.max_output_size)?;
        info!("process registry initialized");
        Ok(Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            streamer,
            terminator: process::default_terminator(),
            kill_grace: config.kill_grace,
        })
    }

    /// Spawn a detached background process and start tracking it.
    pub async fn start(
        &self,
        command: &str,
        working_directory: Option<PathBuf>,
        environment_variables: HashMap<String, String>,
        capture_output: bool,
    ) -> Result<ProcessRecord, ExecError> {
        let process_id = generate_process_id();
        let mut child = process::spawn_shell(
            command,
            working_directory.as_deref(),
            &environment_variables,
            capture_output,
        )
        .map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        let record = ProcessRecord {
            pid,
            process_id: process_id.clone(),
            command: command.to_string(),
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            working_directory,
            environment_variables,
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let output = capture_output.then(|| Arc::new(Mutex::new(OutputBuffer::default())));

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                process_id.clone(),
                TrackedProcess {
                    record: record.clone(),
                    capture_output,
                    child: Arc::clone(&child),
                    output: output.clone(),
                },
            );
        }

        if let Some(buffer) = output {
            self.spawn_capture_task(process_id.clone(), child, buffer, stdout, stderr);
        }

        info!(process_id = %record.process_id, pid, command = %record.command, "started background process");
        Ok(record)
    }

    /// Drain both pipes into the record's buffer until exit, then flip the
    /// status based on the return code.
    fn spawn_capture_task(
        &self,
        process_id: String,
        child: Arc<Mutex<Child>>,
        buffer: Arc<Mutex<OutputBuffer>>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    ) {
        let processes = Arc::clone(&self.processes);
        let streamer = self.streamer.clone();
        tokio::spawn(async move {
            let mut drains = Vec::new();
            if let Some(pipe) = stdout {
                let mut stream = streamer.stream(pipe);
                let buf = Arc::clone(&buffer);
                drains.push(tokio::spawn(async move {
                    while let Some(fragment) = stream.next().await {
                        buf.lock().await.stdout.push_str(&fragment);
                    }
                }));
            }
            if let Some(pipe) = stderr {
                let mut stream = streamer.stream(pipe);
                let buf = Arc::clone(&buffer);
                drains.push(tokio::spawn(async move {
                    while let Some(fragment) = stream.next().await {
                        buf.lock().await.stderr.push_str(&fragment);
                    }
                }));
            }
            for drain in drains {
                let _ = drain.await;
            }

            let status = {
                let mut child = child.lock().await;
                child.wait().await
            };

            let mut processes = processes.lock().await;
            if let Some(tracked) = processes.get_mut(&process_id) {
                if tracked.record.status == ProcessStatus::Running {
                    tracked.record.status = match status {
                        Ok(s) if process::exit_code_of(s) == 0 => ProcessStatus::Completed,
                        Ok(_) => ProcessStatus::Failed,
                        Err(e) => {
                            warn!(process_id = %process_id, error = %e, "could not reap background process");
                            ProcessStatus::Unknown
                        }
                    };
                    debug!(
                        process_id = %process_id,
                        status = %tracked.record.status,
                        "background process finished"
                    );
                }
            }
        });
    }

    /// All tracked processes, statuses refreshed.
    pub async fn list(&self) -> Vec<ProcessRecord> {
        let mut processes = self.processes.lock().await;
        processes
            .values_mut()
            .map(|tracked| {
                refresh(tracked);
                tracked.record.clone()
            })
            .collect()
    }

    /// Current record for one process id.
    pub async fn status(&self, process_id: &str) -> Result<ProcessRecord, ExecError> {
        let mut processes = self.processes.lock().await;
        let tracked = processes
            .get_mut(process_id)
            .ok_or_else(|| ExecError::NotFound {
                process_id: process_id.to_string(),
            })?;
        refresh(tracked);
        Ok(tracked.record.clone())
    }

    /// Terminate a process group: SIGTERM, grace window, SIGKILL.
    ///
    /// Idempotent. Returns false for an unknown id or a process that is no
    /// longer running; it never raises.
    pub async fn kill(&self, process_id: &str) -> bool {
        let pid = {
            let mut processes = self.processes.lock().await;
            match processes.get_mut(process_id) {
                None => {
                    debug!(process_id, "kill requested for unknown process");
                    return false;
                }
                Some(tracked) => {
                    refresh(tracked);
                    if tracked.record.status != ProcessStatus::Running {
                        debug!(
                            process_id,
                            status = %tracked.record.status,
                            "kill requested for process that is not running"
                        );
                        return false;
                    }
                    tracked.record.status = ProcessStatus::Killed;
                    tracked.record.pid
                }
            }
        };

        self.terminator.terminate(pid, self.kill_grace).await;
        info!(process_id, pid, "killed background process");
        true
    }

    /// Kill the process if still running and start a fresh one with the
    /// same command, working directory, environment, and capture setting.
    /// The new record gets a new id; the old record stays queryable in its
    /// terminal state.
    pub async fn restart(&self, process_id: &str) -> Result<ProcessRecord, ExecError> {
        let (command, working_directory, environment_variables, capture_output, running) = {
            let mut processes = self.processes.lock().await;
            let tracked = processes
                .get_mut(process_id)
                .ok_or_else(|| ExecError::NotFound {
                    process_id: process_id.to_string(),
                })?;
            refresh(tracked);
            (
                tracked.record.command.clone(),
                tracked.record.working_directory.clone(),
                tracked.record.environment_variables.clone(),
                tracked.capture_output,
                tracked.record.status == ProcessStatus::Running,
            )
        };

        if running {
            self.kill(process_id).await;
        }

        let record = self
            .start(&command, working_directory, environment_variables, capture_output)
            .await?;
        info!(
            old_process_id = process_id,
            new_process_id = %record.process_id,
            "restarted background process"
        );
        Ok(record)
    }

    /// Snapshot of the output captured so far. Fails with NotFound when
    /// the id is unknown or capture was never requested for it.
    pub async fn output(&self, process_id: &str) -> Result<(String, String), ExecError> {
        let buffer = {
            let processes = self.processes.lock().await;
            processes
                .get(process_id)
                .and_then(|tracked| tracked.output.clone())
                .ok_or_else(|| ExecError::NotFound {
                    process_id: process_id.to_string(),
                })?
        };
        let buffer = buffer.lock().await;
        Ok((buffer.stdout.clone(), buffer.stderr.clone()))
    }

    /// Drop terminal-state records older than `max_age`, freeing their
    /// buffers and handles.
    pub async fn cleanup(&self, max_age: Duration) {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let now = Utc::now();
        let mut processes = self.processes.lock().await;
        let before = processes.len();
        processes.retain(|process_id, tracked| {
            refresh(tracked);
            let expired =
                tracked.record.status.is_terminal() && now - tracked.record.started_at > max_age;
            if expired {
                debug!(process_id, "cleaned up finished process");
            }
            !expired
        });
        let removed = before - processes.len();
        if removed > 0 {
            info!(removed, "cleaned up aged process records");
        }
    }

    /// Kill every running process and clear all tracking state. Used once
    /// at teardown.
    pub async fn shutdown(&self) {
        info!("shutting down process registry");
        let running: Vec<String> = {
            let mut processes = self.processes.lock().await;
            processes
                .iter_mut()
                .filter_map(|(process_id, tracked)| {
                    refresh(tracked);
                    (tracked.record.status == ProcessStatus::Running)
                        .then(|| process_id.clone())
                })
                .collect()
        };

        for process_id in running {
            self.kill(&process_id).await;
        }

        self.processes.lock().await.clear();
        info!("process registry shutdown complete");
    }
}

/// Refresh a record's status in place. Killed is sticky; a record whose
/// handle is held by the capture task is left for that task to finalize.
fn refresh(tracked: &mut TrackedProcess) {
    if tracked.record.status != ProcessStatus::Running {
        return;
    }
    if let Ok(mut child) = tracked.child.try_lock() {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracked.record.status = if process::exit_code_of(status) == 0 {
                    ProcessStatus::Completed
                } else {
                    ProcessStatus::Failed
                };
            }
            Ok(None) => {}
            Err(_) => {
                if !process::is_alive(tracked.record.pid) {
                    tracked.record.status = ProcessStatus::Failed;
                }
            }
        }
    }
}

fn generate_process_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("proc_{}_{}", &hex[..8], Utc::now().timestamp())
}
