//! Runner module - Process lifecycle abstraction layer
//!
//! This module wraps one external process invocation:
//! - `ProcessRunner`: spawns the process, streams its output as events,
//!   queues stdin writes and supports supervisor cancellation
//! - `RunRecord`: argv, timestamps and exit classification of one run
//!
//! The runner module does NOT:
//! - Compare outputs or determine verdicts
//! - Cache compiled binaries
//! - Normalize or cap output text

pub mod decode;
pub mod process;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

pub use process::ProcessRunner;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        let args: Vec<String> = iter.cloned().collect();
        Self {
            program,
            args,
            work_dir: None,
        }
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.clone());
        v
    }
}

/// How a run ended (raw, no verdict interpretation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal the supervisor did not send
    Signaled(i32),
    /// The process never started
    SpawnFailed(String),
    /// Terminated on request of the supervisor
    Cancelled,
}

impl ExitOutcome {
    /// A supervisor cancel counts as success: the process did not fail.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0) | ExitOutcome::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExitOutcome::Cancelled)
    }

    /// Exit code, with cancellation coerced to 0 and `-1` when not applicable
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => *code,
            ExitOutcome::Cancelled => 0,
            _ => -1,
        }
    }

    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(sig)) => ExitOutcome::Signaled(sig),
            (None, None) => ExitOutcome::Exited(-1),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exited with code {}", code),
            ExitOutcome::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
            ExitOutcome::SpawnFailed(msg) => write!(f, "failed to spawn: {}", msg),
            ExitOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Output channel of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
}

/// One execution attempt of one program
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub argv: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub outcome: ExitOutcome,
}

impl RunRecord {
    /// Wall time between spawn and termination, zero unless both happened
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

/// Event emitted by a running process, in order per channel
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Output { channel: Channel, chunk: String },
    /// The channel reached end of stream
    Closed(Channel),
    /// Terminal event, sent after both output channels drained
    Exited(RunRecord),
}
