//! One batch of tests and the capture → validate → build → replay pipeline.
//!
//! Each stage either hands the still-active tests to the next stage or ends
//! the batch after recording a [`GroupedResult`] for them. Every test of the
//! batch ends up in exactly one result.

use crate::artifacts;
use crate::config::{REPLAY_BINARY, RunConfig};
use capreplay_adapters::{BuildTool, CommandSpec, ProcessRunner, RunStatus};
use capreplay_proto::{BatchResult, GroupedResult, Result, ResultCode, TestCase};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Line prefix the replay binary uses for per-test verdicts.
pub const RESULT_TAG: &str = "*RESULT";

pub const MISSING_TRACES_MESSAGE: &str =
    "Skipping replay since capture didn't produce necessary trace files";
pub const NO_RESULT_MESSAGE: &str = "Replay did not report a result";

fn result_line() -> &'static Regex {
    static RESULT_LINE: OnceLock<Regex> = OnceLock::new();
    RESULT_LINE.get_or_init(|| {
        Regex::new(r"^\*RESULT (\S+) (-?\d+)$").expect("result line pattern is valid")
    })
}

/// Per-worker state threaded through every batch the worker runs.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub config: Arc<RunConfig>,
    pub build_tool: BuildTool,
    pub worker_id: usize,
    /// Distinguishes composite files of successive batches on this worker.
    pub composite_file_id: u32,
}

impl WorkerContext {
    pub fn new(config: Arc<RunConfig>, build_tool: BuildTool, worker_id: usize) -> Self {
        Self {
            config,
            build_tool,
            worker_id,
            composite_file_id: 1,
        }
    }

    pub fn trace_folder(&self) -> PathBuf {
        self.config.trace_folder_path(self.worker_id)
    }

    pub fn trace_dir_name(&self) -> String {
        RunConfig::trace_dir_name(self.worker_id)
    }
}

/// Result of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Tests still in play for the next stage.
    Continue(Vec<TestCase>),
    /// The stage recorded results for everything still in play.
    Terminal,
}

/// An ordered group of tests captured, built and replayed together.
#[derive(Debug, Clone, Default)]
pub struct TestBatch {
    tests: Vec<TestCase>,
    results: Vec<GroupedResult>,
}

impl TestBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_test(&mut self, full_name: &str) {
        self.tests.push(TestCase::new(full_name));
    }

    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    pub fn results(&self) -> &[GroupedResult] {
        &self.results
    }

    /// Runs every stage, stopping at the first terminal one.
    ///
    /// An `Err` leaves some tests unclassified; the caller decides how to
    /// record them (see [`TestBatch::record_unclassified`]).
    pub async fn run(
        &mut self,
        ctx: &mut WorkerContext,
        runner: &mut dyn ProcessRunner,
    ) -> Result<()> {
        let StageOutcome::Continue(captured) = self.run_with_capture(ctx, runner).await? else {
            return Ok(());
        };
        let StageOutcome::Continue(survivors) = self.remove_tests_without_traces(ctx, &captured)?
        else {
            return Ok(());
        };

        let built = self.build_replay(ctx, runner, survivors).await;
        if ctx.config.keep_temp_files {
            ctx.composite_file_id += 1;
        }
        let StageOutcome::Continue(survivors) = built? else {
            return Ok(());
        };

        self.run_replay(ctx, runner, survivors).await;
        self.record_unclassified(NO_RESULT_MESSAGE, "");
        Ok(())
    }

    /// Runs the capture-enabled test suite over every test in the batch.
    pub async fn run_with_capture(
        &mut self,
        ctx: &WorkerContext,
        runner: &mut dyn ProcessRunner,
    ) -> Result<StageOutcome> {
        let trace_folder = ctx.trace_folder();
        if !ctx.config.keep_temp_files {
            artifacts::clear_folder_content(&trace_folder)?;
        }
        info!(worker = ctx.worker_id, trace_folder = %trace_folder.display(), "Setting ANGLE_CAPTURE_OUT_DIR");

        let command = capture_command(&ctx.config, &self.tests)
            .env("ANGLE_CAPTURE_FRAME_END", ctx.config.capture_frame_end.to_string())
            .env("ANGLE_CAPTURE_SERIALIZE_STATE", "1")
            .env("ANGLE_CAPTURE_ENABLED", "1")
            .env("ANGLE_CAPTURE_OUT_DIR", trace_folder.to_string_lossy());

        let outcome = runner.run(&command, ctx.config.subprocess_timeout()).await;
        match outcome.status {
            RunStatus::Success => Ok(StageOutcome::Continue(self.tests.clone())),
            RunStatus::Failed => {
                self.results.push(GroupedResult::new(
                    ResultCode::Crashed,
                    format!("Capture run crashed ({})", command.program().display()),
                    outcome.output,
                    self.tests.clone(),
                ));
                Ok(StageOutcome::Terminal)
            }
            RunStatus::TimedOut => {
                self.results.push(GroupedResult::new(
                    ResultCode::TimedOut,
                    "Capture run timed out",
                    "",
                    self.tests.clone(),
                ));
                Ok(StageOutcome::Terminal)
            }
        }
    }

    /// Keeps the tests whose capture left a complete single-context trace,
    /// recording their context ids. The rest are reported as skipped.
    pub fn remove_tests_without_traces(
        &mut self,
        ctx: &WorkerContext,
        active: &[TestCase],
    ) -> Result<StageOutcome> {
        let trace_folder = ctx.trace_folder();
        let mut survivors = Vec::new();
        let mut skipped = Vec::new();

        for test in &mut self.tests {
            if !active.iter().any(|a| a.label() == test.label()) {
                continue;
            }
            match artifacts::can_run_replay(&trace_folder, test)? {
                Some(context_id) => {
                    test.set_context_id(context_id);
                    survivors.push(test.clone());
                }
                None => skipped.push(test.clone()),
            }
        }

        if !skipped.is_empty() {
            debug!(worker = ctx.worker_id, count = skipped.len(), "Tests without usable traces");
            self.results.push(GroupedResult::new(
                ResultCode::Skipped,
                MISSING_TRACES_MESSAGE,
                "",
                skipped,
            ));
        }

        if survivors.is_empty() {
            Ok(StageOutcome::Terminal)
        } else {
            Ok(StageOutcome::Continue(survivors))
        }
    }

    /// Generates the replay sources for `tests` and builds the replay binary.
    pub async fn build_replay(
        &mut self,
        ctx: &WorkerContext,
        runner: &mut dyn ProcessRunner,
        tests: Vec<TestCase>,
    ) -> Result<StageOutcome> {
        let trace_folder = ctx.trace_folder();
        let trace_dir = ctx.trace_dir_name();
        artifacts::write_gni(&trace_folder, &trace_dir, ctx.composite_file_id, &tests)?;
        artifacts::write_composite_files(&trace_folder, ctx.composite_file_id, &tests)?;

        let build_dir = ctx.config.replay_build_dir(ctx.worker_id);
        let gn_args = [
            ("angle_build_capture_replay_tests".to_string(), "true".to_string()),
            ("angle_capture_replay_test_trace_dir".to_string(), format!("\"{trace_dir}\"")),
            (
                "angle_capture_replay_composite_file_id".to_string(),
                ctx.composite_file_id.to_string(),
            ),
        ];

        let generated = ctx.build_tool.generate(runner, &build_dir, &gn_args, true).await;
        if !generated.success() {
            self.results.push(GroupedResult::new(
                ResultCode::CompileFailed,
                "Build replay failed at gn generation",
                generated.output,
                tests,
            ));
            return Ok(StageOutcome::Terminal);
        }

        let built = ctx.build_tool.build(runner, &build_dir, REPLAY_BINARY, true).await;
        if !built.success() {
            self.results.push(GroupedResult::new(
                ResultCode::CompileFailed,
                "Build replay failed at ninja",
                built.output,
                tests,
            ));
            return Ok(StageOutcome::Terminal);
        }

        Ok(StageOutcome::Continue(tests))
    }

    /// Runs the replay binary and classifies `tests` from its result lines.
    pub async fn run_replay(
        &mut self,
        ctx: &WorkerContext,
        runner: &mut dyn ProcessRunner,
        tests: Vec<TestCase>,
    ) {
        let replay_path = ctx.config.replay_binary_path(ctx.worker_id);
        let command = CommandSpec::new(&replay_path)
            .env("ANGLE_CAPTURE_ENABLED", "0")
            .env("ANGLE_FEATURE_OVERRIDES_ENABLED", "enable_capture_limits");

        let outcome = runner.run(&command, ctx.config.subprocess_timeout()).await;
        match outcome.status {
            RunStatus::Failed => {
                self.results.push(GroupedResult::new(
                    ResultCode::Crashed,
                    format!("Replay run crashed ({})", replay_path.display()),
                    outcome.output,
                    tests,
                ));
                return;
            }
            RunStatus::TimedOut => {
                self.results.push(GroupedResult::new(
                    ResultCode::TimedOut,
                    "Replay run timed out",
                    "",
                    tests,
                ));
                return;
            }
            RunStatus::Success => {}
        }

        let verdicts = parse_replay_output(&outcome.output);
        let mut passes = Vec::new();
        let mut fails = Vec::new();
        let mut silent = Vec::new();
        for test in tests {
            match verdicts.get(test.label()) {
                Some(true) => passes.push(test),
                Some(false) => fails.push(test),
                None => silent.push(test),
            }
        }

        if !passes.is_empty() {
            self.results.push(GroupedResult::new(ResultCode::Passed, "", "", passes));
        }
        if !fails.is_empty() {
            self.results.push(GroupedResult::new(ResultCode::ComparisonFailed, "", "", fails));
        }
        if !silent.is_empty() {
            self.results.push(GroupedResult::new(
                ResultCode::Crashed,
                NO_RESULT_MESSAGE,
                outcome.output,
                silent,
            ));
        }
    }

    /// Tests not yet covered by any result.
    pub fn unclassified(&self) -> Vec<TestCase> {
        self.tests
            .iter()
            .filter(|test| !self.results.iter().any(|r| r.covers(test.label())))
            .cloned()
            .collect()
    }

    /// Records every unclassified test as crashed, so none goes unreported.
    pub fn record_unclassified(&mut self, message: &str, output: &str) {
        let missing = self.unclassified();
        if !missing.is_empty() {
            self.results
                .push(GroupedResult::new(ResultCode::Crashed, message, output, missing));
        }
    }

    /// Buckets the recorded results into a report.
    pub fn batch_result(&self, verbose: bool) -> BatchResult {
        BatchResult::new(&self.results, verbose)
    }
}

/// The capture command for `tests`, optionally run under a virtual X server.
fn capture_command(config: &RunConfig, tests: &[TestCase]) -> CommandSpec {
    let test_exe = config.capture_build_dir().join(config.test_suite_binary());
    let command = if config.xvfb {
        CommandSpec::new("vpython").arg("testing/xvfb.py").arg(test_exe.to_string_lossy())
    } else {
        CommandSpec::new(&test_exe)
    };
    let filter = tests
        .iter()
        .map(TestCase::full_name)
        .collect::<Vec<_>>()
        .join(":");
    command
        .arg(format!("--gtest_filter={filter}"))
        .arg("--angle-per-test-capture-label")
}

/// Per-label verdicts from replay output; `true` means passed.
///
/// A label reported more than once passes only if every report passed.
pub fn parse_replay_output(output: &str) -> HashMap<String, bool> {
    let mut verdicts: HashMap<String, bool> = HashMap::new();
    for line in output.lines() {
        let Some(caps) = result_line().captures(line.trim_end()) else {
            continue;
        };
        let passed = caps[2].parse::<i64>().is_ok_and(|code| code == 0);
        verdicts
            .entry(caps[1].to_string())
            .and_modify(|prior| *prior &= passed)
            .or_insert(passed);
    }
    verdicts
}
