//! # Commandeer
//!
//! Supervised OS command execution for calling agents: run a command and
//! wait, stream its output as it happens, or detach it into the background
//! and interrogate it later. Subprocesses run in their own process groups,
//! output is drained with memory bounds, timeouts salvage partial output
//! before the group is signaled, and execution failures always come back
//! as populated results instead of faults.
//!
//! ## Modules
//!
//! - `config` - Plain-value construction-time settings
//! - `error` - Error taxonomy for execution and supervision
//! - `executor` - Single-command execution: blocking, streaming, and
//!   separated-streaming modes with timeout and audit
//! - `models` - Request, result, and process-record types
//! - `process` - Shared spawn and signal primitives (process groups,
//!   graceful-then-forced termination)
//! - `registry` - Background process supervision: start, list, status,
//!   kill, restart, output, cleanup, shutdown
//! - `streamer` - Bounded, decode-safe output streaming with truncation

pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod process;
pub mod registry;
pub mod streamer;

pub use config::ExecutorConfig;
pub use error::ExecError;
pub use executor::{CommandExecutor, SeparatedStreamingExecution, StreamingExecution};
pub use models::{CommandRequest, CommandResult, ProcessRecord, ProcessStatus};
pub use registry::ProcessRegistry;
pub use streamer::{OutputStreamer, StreamSource};
