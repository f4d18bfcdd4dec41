//! Grouped stage outcomes.

use crate::TestCase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome category of a test. Mutually exclusive per test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Replay matched the captured state.
    Passed,
    /// Replay ran but reported a state mismatch.
    ComparisonFailed,
    /// Capture or replay exceeded the subprocess timeout.
    TimedOut,
    /// Capture or replay exited abnormally.
    Crashed,
    /// Generating or building the replay binary failed.
    CompileFailed,
    /// Capture did not produce a usable set of trace files.
    Skipped,
}

impl ResultCode {
    /// All codes in report order.
    pub const ALL: [ResultCode; 6] = [
        ResultCode::Passed,
        ResultCode::ComparisonFailed,
        ResultCode::TimedOut,
        ResultCode::Crashed,
        ResultCode::CompileFailed,
        ResultCode::Skipped,
    ];

    /// Human-readable name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Passed => "Passed",
            ResultCode::ComparisonFailed => "Comparison Failed",
            ResultCode::TimedOut => "Timeout",
            ResultCode::Crashed => "Crashed",
            ResultCode::CompileFailed => "CompileFailed",
            ResultCode::Skipped => "Skipped",
        }
    }

    /// Whether tests in this category fail the run. Skips do not.
    pub fn is_failure(self) -> bool {
        !matches!(self, ResultCode::Passed | ResultCode::Skipped)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outcome shared by a group of tests from the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedResult {
    pub code: ResultCode,
    /// Free-text explanation; empty for results parsed from replay output.
    pub message: String,
    /// Captured process output relevant to this outcome.
    pub output: String,
    pub tests: Vec<TestCase>,
}

impl GroupedResult {
    /// Creates a result covering `tests`.
    pub fn new(
        code: ResultCode,
        message: impl Into<String>,
        output: impl Into<String>,
        tests: Vec<TestCase>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            output: output.into(),
            tests,
        }
    }

    /// Returns true if this result covers a test with the given label.
    pub fn covers(&self, label: &str) -> bool {
        self.tests.iter().any(|test| test.label() == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(ResultCode::ComparisonFailed.to_string(), "Comparison Failed");
        assert_eq!(ResultCode::TimedOut.to_string(), "Timeout");
        assert_eq!(ResultCode::CompileFailed.to_string(), "CompileFailed");
    }

    #[test]
    fn test_skips_are_not_failures() {
        assert!(!ResultCode::Passed.is_failure());
        assert!(!ResultCode::Skipped.is_failure());
        assert!(ResultCode::ComparisonFailed.is_failure());
        assert!(ResultCode::TimedOut.is_failure());
        assert!(ResultCode::Crashed.is_failure());
        assert!(ResultCode::CompileFailed.is_failure());
    }

    #[test]
    fn test_covers_by_label() {
        let result = GroupedResult::new(
            ResultCode::Passed,
            "",
            "",
            vec![TestCase::new("A.B/C"), TestCase::new("A.D/C")],
        );
        assert!(result.covers("A_B_C"));
        assert!(!result.covers("A_E_C"));
    }

    #[test]
    fn test_code_serializes_snake_case() {
        let json = serde_json::to_string(&ResultCode::CompileFailed).unwrap();
        assert_eq!(json, "\"compile_failed\"");
    }
}
