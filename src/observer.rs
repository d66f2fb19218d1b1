//! Status and output notifications
//!
//! The orchestrators report verdict transitions and live output chunks to a
//! `RunObserver`. How the host transports them (UI, terminal, logs) is up to
//! the implementation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{TestcaseId, Verdict};
use crate::jobs::stress::Slot;

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Testcase(TestcaseId),
    Stress(Slot),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Testcase(id) => write!(f, "testcase #{}", id),
            Target::Stress(slot) => write!(f, "stress {}", slot),
        }
    }
}

/// Logical text stream of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Echo of what was written to stdin
    Input,
    Stdout,
    Stderr,
    /// Accepted (reference) output of a testcase
    Accepted,
}

pub trait RunObserver: Send + Sync {
    /// Verdict transition; `elapsed` is set once a run finished
    fn on_status(&self, target: Target, verdict: Verdict, elapsed: Option<Duration>);

    /// Live chunk of a stream. An empty chunk marks the end of the stream.
    fn on_output(&self, target: Target, stream: OutputStream, chunk: &str);
}

/// Observer that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl RunObserver for NullObserver {
    fn on_status(&self, _target: Target, _verdict: Verdict, _elapsed: Option<Duration>) {}

    fn on_output(&self, _target: Target, _stream: OutputStream, _chunk: &str) {}
}

/// Observer that writes statuses to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_status(&self, target: Target, verdict: Verdict, elapsed: Option<Duration>) {
        match elapsed {
            Some(elapsed) => info!("{}: {} ({}ms)", target, verdict, elapsed.as_millis()),
            None => info!("{}: {}", target, verdict),
        }
    }

    fn on_output(&self, target: Target, stream: OutputStream, chunk: &str) {
        if chunk.is_empty() {
            debug!("{}: {:?} closed", target, stream);
        } else {
            debug!("{}: {:?} += {} chars", target, stream, chunk.chars().count());
        }
    }
}
