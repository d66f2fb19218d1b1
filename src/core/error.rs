use std::path::PathBuf;

use thiserror::Error;

use crate::core::testcase::TestcaseId;

/// Errors raised by the orchestrators.
///
/// Expected failure modes of a run (non-zero exit, spawn failure, output
/// mismatch, compile error) are reported through verdicts, not through
/// this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown testcase {0}")]
    UnknownTestcase(TestcaseId),

    #[error("invalid state: {what}")]
    InvalidState { what: String },

    #[error("no language configured for {}", .0.display())]
    NoLanguage(PathBuf),

    #[error("command template {0:?} resolved to an empty command")]
    EmptyCommand(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_state(what: impl Into<String>) -> Self {
        Error::InvalidState { what: what.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
