//! A [`ProcessRunner`] that impersonates the capture, build and replay tools.
//!
//! Commands are recognized by the program's file name:
//! - `gn` / `ninja`: succeed unless scripted otherwise
//! - `capture_replay_tests`: prints a `*RESULT` line per test captured last
//! - anything else is the capture test suite: lists tests for
//!   `--list-tests`, otherwise writes trace files into `ANGLE_CAPTURE_OUT_DIR`
//!   for each test in `--gtest_filter`
//!
//! Clones share the recorded command log, so one script can be handed to every
//! worker and inspected afterwards.

use crate::batch::RESULT_TAG;
use crate::config::REPLAY_BINARY;
use async_trait::async_trait;
use capreplay_adapters::{CommandSpec, ProcessOutcome, ProcessRunner, RunStatus};
use capreplay_proto::{TRACE_FILE_SUFFIX, TestCase};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Writes a complete single-context capture of `test` into `dir`.
pub fn write_capture(dir: &Path, test: &TestCase, context_id: u32) {
    let stem = format!("{}{TRACE_FILE_SUFFIX}{context_id}", test.label());
    let files = [
        format!("{stem}.h"),
        format!("{stem}.cpp"),
        format!("{stem}_frame001.cpp"),
    ];
    for file in &files {
        let _ = std::fs::write(dir.join(file), "");
    }
    let listing = files[1..].join("\n") + "\n";
    let _ = std::fs::write(dir.join(format!("{stem}_files.txt")), listing);
}

/// Scripted stand-in for the real process group.
#[derive(Debug, Clone)]
pub struct ScriptedRunner {
    capture_status: RunStatus,
    gn_status: RunStatus,
    ninja_status: RunStatus,
    replay_status: RunStatus,
    capture_delay: Option<Duration>,
    panic_on_capture: bool,
    test_list: Vec<String>,
    without_traces: HashSet<String>,
    failing: HashSet<String>,
    silent: HashSet<String>,
    folder_removers: HashSet<String>,
    last_captured: Vec<String>,
    commands: Arc<Mutex<Vec<CommandSpec>>>,
    kills: Arc<Mutex<usize>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            capture_status: RunStatus::Success,
            gn_status: RunStatus::Success,
            ninja_status: RunStatus::Success,
            replay_status: RunStatus::Success,
            capture_delay: None,
            panic_on_capture: false,
            test_list: Vec::new(),
            without_traces: HashSet::new(),
            failing: HashSet::new(),
            silent: HashSet::new(),
            folder_removers: HashSet::new(),
            last_captured: Vec::new(),
            commands: Arc::default(),
            kills: Arc::default(),
        }
    }
}

fn names<I, S>(tests: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tests.into_iter().map(Into::into).collect()
}

impl ScriptedRunner {
    /// A script under which every tool succeeds and every test passes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_status(mut self, status: RunStatus) -> Self {
        self.capture_status = status;
        self
    }

    pub fn gn_status(mut self, status: RunStatus) -> Self {
        self.gn_status = status;
        self
    }

    pub fn ninja_status(mut self, status: RunStatus) -> Self {
        self.ninja_status = status;
        self
    }

    pub fn replay_status(mut self, status: RunStatus) -> Self {
        self.replay_status = status;
        self
    }

    /// Makes each capture run take `delay`, timing out if that exceeds the limit.
    pub fn capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = Some(delay);
        self
    }

    /// Makes the capture command panic, as an unexpected internal failure would.
    pub fn panic_on_capture(mut self) -> Self {
        self.panic_on_capture = true;
        self
    }

    /// Names printed for `--list-tests`.
    pub fn with_test_list<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_list = tests.into_iter().map(Into::into).collect();
        self
    }

    /// Tests whose capture leaves no trace files.
    pub fn without_traces<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.without_traces = names(tests);
        self
    }

    /// Tests whose replay reports a nonzero code.
    pub fn failing<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing = names(tests);
        self
    }

    /// Tests the replay never reports on.
    pub fn silent<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.silent = names(tests);
        self
    }

    /// Tests whose capture run deletes the whole trace folder on its way out.
    pub fn removes_trace_folder<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.folder_removers = names(tests);
        self
    }

    /// Every command run so far, across all clones.
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `kill_all` calls, across all clones.
    pub fn kill_count(&self) -> usize {
        *self.kills.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn capture(&mut self, command: &CommandSpec, timeout: Option<Duration>) -> ProcessOutcome {
        if command.get_args().iter().any(|arg| arg == "--list-tests") {
            let output = format!("Tests list:\n{}\n", self.test_list.join("\n"));
            return ProcessOutcome::new(RunStatus::Success, output);
        }
        assert!(!self.panic_on_capture, "scripted capture panic");

        if let Some(delay) = self.capture_delay {
            match timeout {
                Some(limit) if delay > limit => {
                    tokio::time::sleep(limit).await;
                    return ProcessOutcome::new(RunStatus::TimedOut, "timed out");
                }
                _ => tokio::time::sleep(delay).await,
            }
        }
        if self.capture_status != RunStatus::Success {
            return ProcessOutcome::new(self.capture_status, "capture failed");
        }

        let filter = command
            .get_args()
            .iter()
            .find_map(|arg| arg.strip_prefix("--gtest_filter="))
            .unwrap_or_default();
        self.last_captured.clear();
        if let Some(out_dir) = command.get_env("ANGLE_CAPTURE_OUT_DIR") {
            let out_dir = Path::new(out_dir);
            let _ = std::fs::create_dir_all(out_dir);
            let names: Vec<&str> = filter.split(':').filter(|name| !name.is_empty()).collect();
            for name in &names {
                if self.without_traces.contains(*name) {
                    continue;
                }
                write_capture(out_dir, &TestCase::new(*name), 1);
                self.last_captured.push((*name).to_string());
            }
            if names.iter().any(|name| self.folder_removers.contains(*name)) {
                let _ = std::fs::remove_dir_all(out_dir);
            }
        }
        ProcessOutcome::new(RunStatus::Success, "")
    }

    fn replay(&self) -> ProcessOutcome {
        if self.replay_status != RunStatus::Success {
            return ProcessOutcome::new(self.replay_status, "replay failed");
        }
        let mut output = String::from("[ RUN      ] CaptureReplayTests\n");
        for name in &self.last_captured {
            if self.silent.contains(name) {
                continue;
            }
            let code = i32::from(self.failing.contains(name));
            let label = TestCase::new(name.as_str());
            output.push_str(&format!("{RESULT_TAG} {} {code}\n", label.label()));
        }
        ProcessOutcome::new(RunStatus::Success, output)
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&mut self, command: &CommandSpec, timeout: Option<Duration>) -> ProcessOutcome {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());

        let program = command
            .program()
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        match program.as_str() {
            "gn" => ProcessOutcome::new(self.gn_status, "gn output"),
            "ninja" => ProcessOutcome::new(self.ninja_status, "ninja output"),
            REPLAY_BINARY => self.replay(),
            _ => self.capture(command, timeout).await,
        }
    }

    async fn kill_all(&mut self) {
        *self.kills.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}
