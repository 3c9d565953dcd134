//! Single-command execution with timeout, cancellation, and audit.
//!
//! Every failure path here ends in a populated [`CommandResult`] carrying
//! the `-1` sentinel exit code and a human-readable stderr cause; execution
//! failures never escape as errors. Three modes are offered: blocking,
//! merged-stream, and separated-stream.

pub mod safety;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::ExecError;
use crate::models::{CommandRequest, CommandResult};
use crate::process::{self, Terminator};
use crate::streamer::{OutputStream, OutputStreamer, PairedOutputStream, StreamSource};

const FRAGMENT_CHANNEL_CAPACITY: usize = 256;
/// How long a timed-out execution waits for already-buffered output to be
/// salvaged before the process group is signaled.
const SALVAGE_WINDOW: Duration = Duration::from_millis(25);
/// Upper bound on waiting for drain tasks after a kill; a grandchild that
/// escaped the process group can hold the pipes open indefinitely.
const TIMEOUT_DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Handle returned by [`CommandExecutor::execute_with_streaming`].
///
/// `chunks` is the live fragment sequence; iterate it (or drop it) while
/// the command runs. `result` starts preliminary and is finalized in place
/// by the completion task; `completion` resolves once that has happened.
/// Take the `result` lock between pulls on `chunks`, not across them: the
/// drain task needs the lock to append each fragment.
pub struct StreamingExecution {
    pub chunks: ReceiverStream<String>,
    pub result: Arc<Mutex<CommandResult>>,
    pub completion: JoinHandle<()>,
}

/// Handle returned by [`CommandExecutor::execute_with_separated_streaming`].
/// Fragments arrive as (stdout, stderr) pairs with one side populated.
pub struct SeparatedStreamingExecution {
    pub chunks: ReceiverStream<(String, String)>,
    pub result: Arc<Mutex<CommandResult>>,
    pub completion: JoinHandle<()>,
}

/// Runs one command end-to-end.
pub struct CommandExecutor {
    config: ExecutorConfig,
    streamer: OutputStreamer,
    terminator: Arc<dyn Terminator>,
}

struct Launch {
    child: Child,
    timeout: Option<u64>,
    ctx: AuditContext,
}

#[derive(Clone)]
struct AuditContext {
    execution_id: Uuid,
    working_dir: Option<PathBuf>,
    env_count: usize,
    env_names: Vec<String>,
    timeout: Option<u64>,
}

enum Waited {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut(u64),
}

impl CommandExecutor {
    /// Fails only on an invalid buffer size in the config; everything else
    /// is deferred to execution time and reported through results.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecError> {
        let streamer = OutputStreamer::new(config.buffer_size, config.max_output_size)?;
        Ok(Self {
            streamer,
            terminator: process::default_terminator(),
            config,
        })
    }

    pub fn streamer(&self) -> &OutputStreamer {
        &self.streamer
    }

    /// Blocking mode: run the command to completion or timeout.
    pub async fn execute(&self, request: &CommandRequest) -> CommandResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let execution_id = Uuid::new_v4();
        debug!(execution_id = %execution_id, command = %request.command, "executing command");
        safety::warn_if_destructive(&request.command);

        let Launch {
            mut child,
            timeout,
            ctx,
        } = match self.launch(execution_id, request) {
            Ok(launch) => launch,
            Err((message, ctx)) => {
                let result = failure_result(&request.command, started_at, start, message);
                audit(&ctx, &result);
                return result;
            }
        };

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let mut drains: Vec<JoinHandle<()>> = Vec::new();
        if request.capture_output {
            if let Some(pipe) = child.stdout.take() {
                drains.push(drain_into(self.streamer.stream(pipe), Arc::clone(&stdout_buf)));
            }
            if let Some(pipe) = child.stderr.take() {
                drains.push(drain_into(self.streamer.stream(pipe), Arc::clone(&stderr_buf)));
            }
        }

        let outcome = wait_or_timeout(&mut child, timeout).await;

        let (exit_code, stderr_override) = match &outcome {
            Waited::Exited(status) => (process::exit_code_of(*status), None),
            Waited::WaitFailed(e) => (-1, Some(format!("Failed to wait for command: {e}"))),
            Waited::TimedOut(secs) => {
                // Salvage whatever is already buffered, then take the
                // group down.
                tokio::time::sleep(SALVAGE_WINDOW).await;
                if let Some(pid) = child.id() {
                    self.terminator.terminate(pid, self.config.kill_grace).await;
                }
                let _ = child.kill().await;
                (-1, Some(format!("Command timed out after {secs} seconds")))
            }
        };

        if matches!(outcome, Waited::TimedOut(_)) {
            let join_all = async {
                for drain in &mut drains {
                    let _ = drain.await;
                }
            };
            if tokio::time::timeout(TIMEOUT_DRAIN_LIMIT, join_all).await.is_err() {
                for drain in &drains {
                    drain.abort();
                }
            }
        } else {
            for drain in &mut drains {
                let _ = drain.await;
            }
        }

        let stdout = stdout_buf.lock().await.clone();
        let captured_stderr = stderr_buf.lock().await.clone();
        let result = CommandResult {
            command: request.command.clone(),
            exit_code,
            stdout,
            stderr: stderr_override.unwrap_or(captured_stderr),
            execution_time: start.elapsed().as_secs_f64(),
            started_at,
            completed_at: Utc::now(),
            captured_chunks: None,
        };
        audit(&ctx, &result);
        result
    }

    /// Streaming mode: returns immediately with a live fragment sequence
    /// and a shared result cell a detached completion task finalizes.
    pub async fn execute_with_streaming(&self, request: &CommandRequest) -> StreamingExecution {
        let started_at = Utc::now();
        let start = Instant::now();
        let execution_id = Uuid::new_v4();
        debug!(execution_id = %execution_id, command = %request.command, "executing command with streaming");
        safety::warn_if_destructive(&request.command);

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let result = Arc::new(Mutex::new(CommandResult::preliminary(
            &request.command,
            started_at,
            true,
        )));

        let Launch {
            mut child,
            timeout,
            ctx,
        } = match self.launch(execution_id, request) {
            Ok(launch) => launch,
            Err((message, ctx)) => {
                finalize_failure(&result, message, start, &ctx).await;
                drop(tx);
                return StreamingExecution {
                    chunks: ReceiverStream::new(rx),
                    result,
                    completion: tokio::spawn(async {}),
                };
            }
        };

        let (frag_tx, frag_rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        if let Some(pipe) = child.stdout.take() {
            spawn_fragment_feeder(self.streamer.stream(pipe), StreamSource::Stdout, frag_tx.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_fragment_feeder(self.streamer.stream(pipe), StreamSource::Stderr, frag_tx.clone());
        }
        drop(frag_tx);

        let collector = spawn_merged_collector(frag_rx, Arc::clone(&result), tx);
        let completion = tokio::spawn(drive_to_completion(
            child,
            timeout,
            Arc::clone(&self.terminator),
            self.config.kill_grace,
            collector,
            Arc::clone(&result),
            start,
            ctx,
        ));

        StreamingExecution {
            chunks: ReceiverStream::new(rx),
            result,
            completion,
        }
    }

    /// Separated streaming mode: same contract as
    /// [`Self::execute_with_streaming`] but fragments arrive as
    /// (stdout, stderr) pairs and the completion task rebuilds the unified
    /// strings from the pair history.
    pub async fn execute_with_separated_streaming(
        &self,
        request: &CommandRequest,
    ) -> SeparatedStreamingExecution {
        let started_at = Utc::now();
        let start = Instant::now();
        let execution_id = Uuid::new_v4();
        debug!(execution_id = %execution_id, command = %request.command, "executing command with separated streaming");
        safety::warn_if_destructive(&request.command);

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let result = Arc::new(Mutex::new(CommandResult::preliminary(
            &request.command,
            started_at,
            true,
        )));

        let Launch {
            mut child,
            timeout,
            ctx,
        } = match self.launch(execution_id, request) {
            Ok(launch) => launch,
            Err((message, ctx)) => {
                finalize_failure(&result, message, start, &ctx).await;
                drop(tx);
                return SeparatedStreamingExecution {
                    chunks: ReceiverStream::new(rx),
                    result,
                    completion: tokio::spawn(async {}),
                };
            }
        };

        let pair_stream = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => Some(self.streamer.stream_separated(out, err)),
            _ => None,
        };
        let collector = spawn_separated_collector(pair_stream, Arc::clone(&result), tx);
        let completion = tokio::spawn(drive_to_completion(
            child,
            timeout,
            Arc::clone(&self.terminator),
            self.config.kill_grace,
            collector,
            Arc::clone(&result),
            start,
            ctx,
        ));

        SeparatedStreamingExecution {
            chunks: ReceiverStream::new(rx),
            result,
            completion,
        }
    }

    /// Validate, resolve defaults, and spawn. On failure the caller gets
    /// the stderr cause plus an audit context for the failure record.
    fn launch(
        &self,
        execution_id: Uuid,
        request: &CommandRequest,
    ) -> Result<Launch, (String, AuditContext)> {
        let timeout = self.effective_timeout(request);
        let working_dir = match self.resolve_working_dir(request) {
            Ok(dir) => dir,
            Err(error) => {
                let ctx = self.audit_context(
                    execution_id,
                    request,
                    request.working_directory.clone(),
                    timeout,
                );
                return Err((error.stderr_text(), ctx));
            }
        };
        let ctx = self.audit_context(execution_id, request, working_dir.clone(), timeout);

        match process::spawn_shell(
            &request.command,
            working_dir.as_deref(),
            &request.environment_variables,
            request.capture_output,
        ) {
            Ok(child) => Ok(Launch {
                child,
                timeout,
                ctx,
            }),
            Err(source) => {
                let message = ExecError::Spawn {
                    command: request.command.clone(),
                    source,
                }
                .stderr_text();
                Err((message, ctx))
            }
        }
    }

    fn effective_timeout(&self, request: &CommandRequest) -> Option<u64> {
        let timeout = request.timeout.or(self.config.default_timeout);
        if timeout == Some(0) {
            warn!(
                command = %request.command,
                "zero-second timeout requested; the timer expires immediately"
            );
        }
        timeout
    }

    fn resolve_working_dir(&self, request: &CommandRequest) -> Result<Option<PathBuf>, ExecError> {
        let dir = request
            .working_directory
            .clone()
            .or_else(|| self.config.default_working_directory.clone());
        if let Some(dir) = &dir {
            if !dir.exists() {
                return Err(ExecError::Validation {
                    message: format!("Working directory not found: {}", dir.display()),
                });
            }
            if !dir.is_dir() {
                return Err(ExecError::Validation {
                    message: format!("Working directory is not a directory: {}", dir.display()),
                });
            }
        }
        Ok(dir)
    }

    fn audit_context(
        &self,
        execution_id: Uuid,
        request: &CommandRequest,
        working_dir: Option<PathBuf>,
        timeout: Option<u64>,
    ) -> AuditContext {
        let mut env_names: Vec<String> = request.environment_variables.keys().cloned().collect();
        env_names.sort();
        AuditContext {
            execution_id,
            working_dir,
            env_count: request.environment_variables.len(),
            env_names,
            timeout,
        }
    }
}

async fn wait_or_timeout(child: &mut Child, timeout_secs: Option<u64>) -> Waited {
    match timeout_secs {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
                Ok(Ok(status)) => Waited::Exited(status),
                Ok(Err(e)) => Waited::WaitFailed(e),
                Err(_) => Waited::TimedOut(secs),
            }
        }
        None => match child.wait().await {
            Ok(status) => Waited::Exited(status),
            Err(e) => Waited::WaitFailed(e),
        },
    }
}

fn drain_into(mut stream: OutputStream, buffer: Arc<Mutex<String>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fragment) = stream.next().await {
            buffer.lock().await.push_str(&fragment);
        }
    })
}

fn spawn_fragment_feeder(
    mut stream: OutputStream,
    source: StreamSource,
    tx: mpsc::Sender<(StreamSource, String)>,
) {
    tokio::spawn(async move {
        while let Some(fragment) = stream.next().await {
            if tx.send((source, fragment)).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_merged_collector(
    mut rx: mpsc::Receiver<(StreamSource, String)>,
    result: Arc<Mutex<CommandResult>>,
    tx: mpsc::Sender<String>,
) -> JoinHandle<(String, String)> {
    tokio::spawn(async move {
        let mut stdout_acc = String::new();
        let mut stderr_acc = String::new();
        while let Some((source, fragment)) = rx.recv().await {
            match source {
                StreamSource::Stdout => stdout_acc.push_str(&fragment),
                StreamSource::Stderr => stderr_acc.push_str(&fragment),
            }
            if let Some(chunks) = result.lock().await.captured_chunks.as_mut() {
                chunks.push(fragment.clone());
            }
            let _ = tx.send(fragment).await;
        }
        (stdout_acc, stderr_acc)
    })
}

fn spawn_separated_collector(
    stream: Option<PairedOutputStream>,
    result: Arc<Mutex<CommandResult>>,
    tx: mpsc::Sender<(String, String)>,
) -> JoinHandle<(String, String)> {
    tokio::spawn(async move {
        let mut stdout_acc = String::new();
        let mut stderr_acc = String::new();
        let Some(mut stream) = stream else {
            return (stdout_acc, stderr_acc);
        };
        while let Some((out_frag, err_frag)) = stream.next().await {
            stdout_acc.push_str(&out_frag);
            stderr_acc.push_str(&err_frag);
            {
                let mut r = result.lock().await;
                if let Some(chunks) = r.captured_chunks.as_mut() {
                    if !out_frag.is_empty() {
                        chunks.push(out_frag.clone());
                    }
                    if !err_frag.is_empty() {
                        chunks.push(err_frag.clone());
                    }
                }
            }
            let _ = tx.send((out_frag, err_frag)).await;
        }
        (stdout_acc, stderr_acc)
    })
}

/// Shared tail of both streaming modes: race the process against the
/// timer, kill the group on expiry, then finalize the shared result.
#[allow(clippy::too_many_arguments)]
async fn drive_to_completion(
    mut child: Child,
    timeout: Option<u64>,
    terminator: Arc<dyn Terminator>,
    grace: Duration,
    mut collector: JoinHandle<(String, String)>,
    result: Arc<Mutex<CommandResult>>,
    start: Instant,
    ctx: AuditContext,
) {
    let outcome = wait_or_timeout(&mut child, timeout).await;

    if matches!(outcome, Waited::TimedOut(_)) {
        tokio::time::sleep(SALVAGE_WINDOW).await;
        if let Some(pid) = child.id() {
            terminator.terminate(pid, grace).await;
        }
        let _ = child.kill().await;
    }

    let (stdout_acc, stderr_acc) = if matches!(outcome, Waited::TimedOut(_)) {
        match tokio::time::timeout(TIMEOUT_DRAIN_LIMIT, &mut collector).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                collector.abort();
                Default::default()
            }
        }
    } else {
        collector.await.unwrap_or_default()
    };

    let (exit_code, stderr_text) = match outcome {
        Waited::Exited(status) => (process::exit_code_of(status), stderr_acc),
        Waited::WaitFailed(e) => (-1, format!("Failed to wait for command: {e}")),
        Waited::TimedOut(secs) => (-1, format!("Command timed out after {secs} seconds")),
    };

    let mut r = result.lock().await;
    r.exit_code = exit_code;
    r.stdout = stdout_acc;
    r.stderr = stderr_text;
    r.completed_at = Utc::now();
    r.execution_time = start.elapsed().as_secs_f64();
    audit(&ctx, &r);
}

async fn finalize_failure(
    result: &Arc<Mutex<CommandResult>>,
    message: String,
    start: Instant,
    ctx: &AuditContext,
) {
    let mut r = result.lock().await;
    r.exit_code = -1;
    r.stderr = message;
    r.completed_at = Utc::now();
    r.execution_time = start.elapsed().as_secs_f64();
    audit(ctx, &r);
}

fn failure_result(
    command: &str,
    started_at: DateTime<Utc>,
    start: Instant,
    stderr: String,
) -> CommandResult {
    CommandResult {
        command: command.to_string(),
        exit_code: -1,
        stdout: String::new(),
        stderr,
        execution_time: start.elapsed().as_secs_f64(),
        started_at,
        completed_at: Utc::now(),
        captured_chunks: None,
    }
}

/// One structured record per execution. Environment variable values are
/// never logged; names only at trace level.
fn audit(ctx: &AuditContext, result: &CommandResult) {
    info!(
        execution_id = %ctx.execution_id,
        command = %result.command,
        working_directory = ?ctx.working_dir,
        env_override_count = ctx.env_count,
        timeout_secs = ?ctx.timeout,
        exit_code = result.exit_code,
        execution_time = result.execution_time,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        success = result.success(),
        "command execution finished"
    );
    trace!(env_overrides = ?ctx.env_names, "environment override names");
    if result.success() {
        info!(
            "command succeeded in {:.3}s: {}",
            result.execution_time, result.command
        );
    } else {
        warn!(
            "command failed (exit {}) in {:.3}s: {}",
            result.exit_code, result.execution_time, result.command
        );
    }
}
