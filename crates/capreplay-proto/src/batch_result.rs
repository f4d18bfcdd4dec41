//! Per-batch result summary.

use crate::{GroupedResult, ResultCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker gtest prints at the start of each test.
const RUN_MARKER: &str = "[ RUN      ]";

/// Marker compilers print on error lines.
const ERROR_MARKER: &str = ": error:";

/// Test names of one batch, bucketed by result code, plus a rendered report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub passes: Vec<String>,
    pub fails: Vec<String>,
    pub timeouts: Vec<String>,
    pub crashes: Vec<String>,
    pub compile_fails: Vec<String>,
    pub skips: Vec<String>,
    rendered: String,
}

impl BatchResult {
    /// Buckets the tests of `results` and renders the text report.
    ///
    /// When `verbose` is false, only a digest of each result's output is kept:
    /// compiler error lines for compile failures, and the tail from the last
    /// started test for everything else.
    pub fn new(results: &[GroupedResult], verbose: bool) -> Self {
        let mut batch = Self::default();
        for result in results {
            let names = result.tests.iter().map(|t| t.full_name().to_string());
            batch.bucket_mut(result.code).extend(names);
        }
        batch.rendered = render(results, verbose);
        batch
    }

    /// Names recorded under `code`.
    pub fn bucket(&self, code: ResultCode) -> &[String] {
        match code {
            ResultCode::Passed => &self.passes,
            ResultCode::ComparisonFailed => &self.fails,
            ResultCode::TimedOut => &self.timeouts,
            ResultCode::Crashed => &self.crashes,
            ResultCode::CompileFailed => &self.compile_fails,
            ResultCode::Skipped => &self.skips,
        }
    }

    fn bucket_mut(&mut self, code: ResultCode) -> &mut Vec<String> {
        match code {
            ResultCode::Passed => &mut self.passes,
            ResultCode::ComparisonFailed => &mut self.fails,
            ResultCode::TimedOut => &mut self.timeouts,
            ResultCode::Crashed => &mut self.crashes,
            ResultCode::CompileFailed => &mut self.compile_fails,
            ResultCode::Skipped => &mut self.skips,
        }
    }

    /// Total number of tests across all buckets.
    pub fn total(&self) -> usize {
        ResultCode::ALL.iter().map(|&code| self.bucket(code).len()).sum()
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

fn render(results: &[GroupedResult], verbose: bool) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!("{}: {}\n", result.code, result.message));
        for test in &result.tests {
            out.push('\t');
            out.push_str(test.full_name());
            out.push('\n');
        }
        if verbose {
            out.push_str(&result.output);
        } else if result.code == ResultCode::CompileFailed {
            out.push_str(&extract_errors(&result.output));
        } else {
            out.push_str(&abbreviated_output(&result.output));
        }
    }
    out
}

/// Lines containing a compiler error, each followed by the next line.
pub(crate) fn extract_errors(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let mut errors = String::new();
    for (i, line) in lines.iter().enumerate() {
        if line.contains(ERROR_MARKER) {
            errors.push_str(line);
            errors.push('\n');
            if let Some(next) = lines.get(i + 1) {
                errors.push_str(next);
                errors.push('\n');
            }
        }
    }
    errors
}

/// All lines from the last gtest `RUN` marker onward, or everything if absent.
pub(crate) fn abbreviated_output(output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = output.lines().collect();
    let start = lines
        .iter()
        .rposition(|line| line.contains(RUN_MARKER))
        .unwrap_or(0);
    format!("\n{}\n", lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestCase;

    fn tests(names: &[&str]) -> Vec<TestCase> {
        names.iter().map(|n| TestCase::new(*n)).collect()
    }

    #[test]
    fn test_buckets_by_code() {
        let results = vec![
            GroupedResult::new(ResultCode::Passed, "", "", tests(&["A.a/X", "A.b/X"])),
            GroupedResult::new(ResultCode::Skipped, "no traces", "", tests(&["A.c/X"])),
            GroupedResult::new(ResultCode::ComparisonFailed, "", "", tests(&["A.d/X"])),
        ];
        let batch = BatchResult::new(&results, false);

        assert_eq!(batch.passes, vec!["A.a/X", "A.b/X"]);
        assert_eq!(batch.skips, vec!["A.c/X"]);
        assert_eq!(batch.fails, vec!["A.d/X"]);
        assert!(batch.crashes.is_empty());
        assert_eq!(batch.total(), 4);
    }

    #[test]
    fn test_render_lists_tests_under_header() {
        let results = vec![GroupedResult::new(
            ResultCode::Skipped,
            "no traces",
            "",
            tests(&["A.c/X"]),
        )];
        let text = BatchResult::new(&results, false).to_string();
        assert_eq!(text, "Skipped: no traces\n\tA.c/X\n");
    }

    #[test]
    fn test_verbose_keeps_full_output() {
        let output = "line one\n[ RUN      ] A.a/X\nline three\n";
        let results = vec![GroupedResult::new(
            ResultCode::Crashed,
            "",
            output,
            tests(&["A.a/X"]),
        )];
        let text = BatchResult::new(&results, true).to_string();
        assert!(text.contains("line one"));
        assert!(text.ends_with(output));
    }

    #[test]
    fn test_abbreviated_output_starts_at_last_run() {
        let output = "[ RUN      ] A.a/X\nok\n[ RUN      ] A.b/X\nboom\n";
        assert_eq!(abbreviated_output(output), "\n[ RUN      ] A.b/X\nboom\n");
    }

    #[test]
    fn test_abbreviated_output_without_marker_keeps_everything() {
        assert_eq!(abbreviated_output("a\nb"), "\na\nb\n");
        assert_eq!(abbreviated_output(""), "");
    }

    #[test]
    fn test_extract_errors_keeps_following_line() {
        let output = "ninja: building\n\
                      foo.cpp:1:2: error: unknown type\n\
                      \x20   int x = y;\n\
                      done\n\
                      bar.cpp:9:9: error: last line";
        let errors = extract_errors(output);
        assert_eq!(
            errors,
            "foo.cpp:1:2: error: unknown type\n    int x = y;\nbar.cpp:9:9: error: last line\n"
        );
    }

    #[test]
    fn test_compile_failure_renders_only_errors() {
        let results = vec![GroupedResult::new(
            ResultCode::CompileFailed,
            "Build replay failed at ninja",
            "noise\nx.cpp:1:1: error: bad\ncontext\nmore noise\n",
            tests(&["A.a/X"]),
        )];
        let text = BatchResult::new(&results, false).to_string();
        assert!(text.contains("x.cpp:1:1: error: bad\ncontext\n"));
        assert!(!text.contains("more noise"));
    }
}
