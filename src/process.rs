//! Spawn and signal primitives shared by the executor and the registry.
//!
//! Commands run through the shell in their own process group so that a
//! single signal reaches everything a pipeline spawned. Termination is a
//! capability-gated strategy: POSIX group signaling where available, a
//! direct single-process kill otherwise.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// Spawn `sh -c <command>` in a fresh process group.
///
/// Environment overrides are merged onto the inherited environment. With
/// `capture` set, stdout/stderr are piped; otherwise they are inherited
/// from the calling process.
pub fn spawn_shell(
    command: &str,
    working_dir: Option<&Path>,
    env: &HashMap<String, String>,
    capture: bool,
) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);

    // New process group so group signals reach a pipeline's children.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null());
    if capture {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    }

    cmd.spawn()
}

/// Map an exit status to the result exit code: the process's own code, or
/// the negated signal number when it died to a signal.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else {
        signal_code(status)
    }
}

#[cfg(unix)]
fn signal_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| -s).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_code(_status: std::process::ExitStatus) -> i32 {
    -1
}

/// Liveness probe: does the pid still refer to a live process?
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Graceful-then-forced termination of a spawned command.
#[async_trait]
pub trait Terminator: Send + Sync {
    /// SIGTERM, wait out the grace window, SIGKILL if still alive.
    /// Returns false if nothing was signaled (the process was already
    /// gone); failed delivery to a dead process is benign, never an error.
    async fn terminate(&self, pid: u32, grace: Duration) -> bool;
}

/// Signals the whole process group (POSIX).
pub struct GroupTerminator;

/// Signals only the direct child; fallback where group signaling is
/// unsupported.
pub struct DirectTerminator;

#[cfg(unix)]
async fn signal_with_grace(target: nix::unistd::Pid, pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::{self, Signal};

    if signal::kill(target, Signal::SIGTERM).is_err() {
        debug!(pid, "termination target already gone");
        return false;
    }
    tokio::time::sleep(grace).await;
    if is_alive(pid) {
        debug!(pid, "still alive after grace window, sending SIGKILL");
        let _ = signal::kill(target, Signal::SIGKILL);
    }
    true
}

#[cfg(unix)]
async fn group_terminate(pid: u32, grace: Duration) -> bool {
    // Negative pid addresses the process group.
    signal_with_grace(nix::unistd::Pid::from_raw(-(pid as i32)), pid, grace).await
}

#[cfg(not(unix))]
async fn group_terminate(_pid: u32, _grace: Duration) -> bool {
    debug!("process-group signaling unsupported on this platform");
    false
}

#[cfg(unix)]
async fn direct_terminate(pid: u32, grace: Duration) -> bool {
    signal_with_grace(nix::unistd::Pid::from_raw(pid as i32), pid, grace).await
}

#[cfg(not(unix))]
async fn direct_terminate(_pid: u32, _grace: Duration) -> bool {
    debug!("signal delivery unsupported on this platform");
    false
}

#[async_trait]
impl Terminator for GroupTerminator {
    async fn terminate(&self, pid: u32, grace: Duration) -> bool {
        group_terminate(pid, grace).await
    }
}

#[async_trait]
impl Terminator for DirectTerminator {
    async fn terminate(&self, pid: u32, grace: Duration) -> bool {
        direct_terminate(pid, grace).await
    }
}

/// Pick the termination strategy for this platform.
pub fn default_terminator() -> Arc<dyn Terminator> {
    if cfg!(unix) {
        Arc::new(GroupTerminator)
    } else {
        Arc::new(DirectTerminator)
    }
}
