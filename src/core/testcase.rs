//! Testcase model
//!
//! A testcase is the judged unit of a single-run session: the stored input,
//! the captured output of the last run and the accepted (reference) output.

use serde::{Deserialize, Serialize};

use crate::core::verdict::Verdict;

pub type TestcaseId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testcase {
    pub id: TestcaseId,
    pub input: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: String,
    /// Accepted output; empty means there is no oracle
    #[serde(default)]
    pub accepted: String,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub verdict: Verdict,
    /// Whether the detail panel is shown
    #[serde(default)]
    pub show_detail: bool,
    /// Set once the user toggled visibility by hand; disables auto-visibility
    #[serde(default)]
    pub manual_visibility: bool,
    /// Excluded from batch runs
    #[serde(default)]
    pub skip: bool,
}

impl Testcase {
    pub fn new(id: TestcaseId, input: impl Into<String>, accepted: impl Into<String>) -> Self {
        Self {
            id,
            input: input.into(),
            stderr: String::new(),
            stdout: String::new(),
            accepted: accepted.into(),
            elapsed_ms: 0,
            verdict: Verdict::NotApplicable,
            show_detail: true,
            manual_visibility: false,
            skip: false,
        }
    }

    /// Show details of anything that is not accepted, unless the user chose
    pub fn apply_auto_visibility(&mut self) {
        if !self.manual_visibility {
            self.show_detail = self.verdict != Verdict::Accepted;
        }
    }

    pub fn toggle_detail(&mut self) {
        self.show_detail = !self.show_detail;
        self.manual_visibility = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_visibility() {
        let mut tc = Testcase::new(1, "1 2\n", "3\n");
        tc.verdict = Verdict::Accepted;
        tc.apply_auto_visibility();
        assert!(!tc.show_detail);

        tc.verdict = Verdict::WrongAnswer;
        tc.apply_auto_visibility();
        assert!(tc.show_detail);
    }

    #[test]
    fn test_manual_override_sticks() {
        let mut tc = Testcase::new(1, "", "");
        tc.toggle_detail();
        assert!(!tc.show_detail);
        assert!(tc.manual_visibility);

        tc.verdict = Verdict::RuntimeError;
        tc.apply_auto_visibility();
        assert!(!tc.show_detail);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let tc: Testcase = serde_json::from_str(r#"{"id": 3, "input": "5\n"}"#).unwrap();
        assert_eq!(tc.id, 3);
        assert_eq!(tc.verdict, Verdict::NotApplicable);
        assert!(!tc.skip);
    }
}
