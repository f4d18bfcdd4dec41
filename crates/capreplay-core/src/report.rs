//! Run-wide report folded from every batch result.

use capreplay_proto::{BatchResult, ResultCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Per-category totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub passed: usize,
    pub comparison_failed: usize,
    pub crashed: usize,
    pub compile_failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
}

impl ReportCounts {
    pub fn total(&self) -> usize {
        self.passed
            + self.comparison_failed
            + self.crashed
            + self.compile_failed
            + self.skipped
            + self.timed_out
    }
}

/// Sorted name lists per category, with timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: ReportCounts,
    pub passes: Vec<String>,
    pub fails: Vec<String>,
    pub crashes: Vec<String>,
    pub compile_fails: Vec<String>,
    pub skips: Vec<String>,
    pub timeouts: Vec<String>,
}

impl AggregateReport {
    /// Folds `results` (in any order) into one report.
    pub fn fold(results: &[BatchResult], started_at: DateTime<Utc>) -> Self {
        let collect = |code: ResultCode| {
            let mut names: Vec<String> = results
                .iter()
                .flat_map(|r| r.bucket(code).iter().cloned())
                .collect();
            names.sort();
            names
        };

        let passes = collect(ResultCode::Passed);
        let fails = collect(ResultCode::ComparisonFailed);
        let crashes = collect(ResultCode::Crashed);
        let compile_fails = collect(ResultCode::CompileFailed);
        let skips = collect(ResultCode::Skipped);
        let timeouts = collect(ResultCode::TimedOut);

        Self {
            started_at,
            finished_at: Utc::now(),
            counts: ReportCounts {
                passed: passes.len(),
                comparison_failed: fails.len(),
                crashed: crashes.len(),
                compile_failed: compile_fails.len(),
                skipped: skips.len(),
                timed_out: timeouts.len(),
            },
            passes,
            fails,
            crashes,
            compile_fails,
            skips,
            timeouts,
        }
    }

    /// True when nothing failed, crashed, failed to compile, or timed out.
    ///
    /// Skipped tests do not count against the run.
    pub fn is_success(&self) -> bool {
        ResultCode::ALL
            .into_iter()
            .filter(|code| code.is_failure())
            .all(|code| self.names(code).is_empty())
    }

    /// Sorted names of the tests that ended in `code`.
    pub fn names(&self, code: ResultCode) -> &[String] {
        match code {
            ResultCode::Passed => &self.passes,
            ResultCode::ComparisonFailed => &self.fails,
            ResultCode::Crashed => &self.crashes,
            ResultCode::CompileFailed => &self.compile_fails,
            ResultCode::Skipped => &self.skips,
            ResultCode::TimedOut => &self.timeouts,
        }
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    pub fn elapsed_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// The human-readable summary, one log line per entry.
    pub fn summary_lines(&self) -> Vec<String> {
        let c = &self.counts;
        let mut lines = vec![
            format!("Elapsed time: {:.2} seconds", self.elapsed_secs()),
            format!(
                "Passed: {}, Comparison Failed: {}, Crashed: {}, CompileFailed {}, Skipped: {}, Timeout: {}",
                c.passed, c.comparison_failed, c.crashed, c.compile_failed, c.skipped, c.timed_out
            ),
        ];
        let sections = [
            ("Comparison Failed tests:", &self.fails),
            ("Crashed tests:", &self.crashes),
            ("Compile failed tests:", &self.compile_fails),
            ("Skipped tests:", &self.skips),
            ("Timeout tests:", &self.timeouts),
        ];
        for (title, names) in sections {
            if names.is_empty() {
                continue;
            }
            lines.push(title.to_string());
            lines.extend(names.iter().map(|name| format!("  {name}")));
        }
        lines
    }

    pub fn log_summary(&self) {
        info!("Results:");
        for line in self.summary_lines() {
            info!("{line}");
        }
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
