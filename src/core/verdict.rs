use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::utils::compare_output;
use crate::runner::ExitOutcome;

/// Verdict of a testcase or stress slot
///
/// `NotApplicable` doubles as "not yet run": there is no oracle (or no run)
/// to judge against. `Compiling`, `Running` and `Editing` are transient
/// states a testcase passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    NotApplicable,
    CompileError,
    RuntimeError,
    WrongAnswer,
    Accepted,
    Compiling,
    Running,
    Editing,
}

impl Verdict {
    /// Whether this verdict is the result of a finished judgement
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Verdict::Compiling | Verdict::Running | Verdict::Editing
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::NotApplicable => "not_applicable",
            Verdict::CompileError => "compile_error",
            Verdict::RuntimeError => "runtime_error",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::Accepted => "accepted",
            Verdict::Compiling => "compiling",
            Verdict::Running => "running",
            Verdict::Editing => "editing",
        };
        write!(f, "{}", s)
    }
}

/// Judge a finished run.
///
/// A failed exit wins over everything else. An empty reference means there
/// is nothing to compare against.
pub fn classify(outcome: &ExitOutcome, actual: &str, reference: &str) -> Verdict {
    if !outcome.is_success() {
        return Verdict::RuntimeError;
    }
    if reference.trim().is_empty() {
        return Verdict::NotApplicable;
    }
    if compare_output(actual, reference) {
        Verdict::Accepted
    } else {
        Verdict::WrongAnswer
    }
}
