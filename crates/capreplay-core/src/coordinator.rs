//! The coordinator: prepare, discover, partition, fan out, aggregate.

use crate::artifacts;
use crate::batch::{TestBatch, WorkerContext};
use crate::expectations::{SkipList, parse_test_list};
use crate::queue::{JobQueue, ResultLog};
use crate::report::AggregateReport;
use crate::worker::{cancelled, run_worker};
use crate::RunConfig;
use capreplay_adapters::{BuildTool, CommandSpec, ProcessGroup, ProcessRunner};
use capreplay_proto::{TestCase, WorkerMessage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How long interrupted workers get to stop their processes before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Errors that end a run before any batch is scheduled.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Failed to build the capture test suite ({step}):\n{output}")]
    CaptureBuild { step: &'static str, output: String },

    #[error("Failed to list tests:\n{0}")]
    Discovery(String),

    #[error("Failed to read {path}: {source}")]
    Expectations {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Batch(#[from] capreplay_proto::Error),
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(AggregateReport),
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(report) => report.exit_code(),
            RunOutcome::Interrupted => 1,
        }
    }
}

/// Worker tasks to start: one per batch, capped by spare cores and `max_jobs`.
///
/// One core is left to the coordinator; zero batches need zero workers.
pub fn worker_count(cpus: usize, max_jobs: usize, batches: usize) -> usize {
    if batches == 0 {
        return 0;
    }
    trace_folder_count(cpus, max_jobs).min(batches)
}

/// Trace folders to prepare before the batch count is known.
pub fn trace_folder_count(cpus: usize, max_jobs: usize) -> usize {
    cpus.saturating_sub(1).min(max_jobs).max(1)
}

/// Splits `names` round-robin into `ceil(len / batch_size)` batches.
///
/// Fails if two names map to the same label, since their trace files would collide.
pub fn partition(names: &[String], batch_size: usize) -> capreplay_proto::Result<Vec<TestBatch>> {
    let mut labels: HashMap<String, &str> = HashMap::new();
    for name in names {
        let label = TestCase::new(name.as_str()).label().to_string();
        if let Some(first) = labels.insert(label.clone(), name) {
            return Err(capreplay_proto::Error::DuplicateLabel {
                label,
                first: first.to_string(),
                second: name.clone(),
            });
        }
    }

    let count = names.len().div_ceil(batch_size.max(1));
    let mut batches = vec![TestBatch::new(); count];
    for (index, name) in names.iter().enumerate() {
        batches[index % count].add_test(name);
    }
    Ok(batches)
}

/// Drives one capture/replay run.
#[derive(Debug)]
pub struct Coordinator {
    config: Arc<RunConfig>,
    build_tool: BuildTool,
    cancel: watch::Receiver<bool>,
    started_at: DateTime<Utc>,
}

impl Coordinator {
    pub fn new(config: Arc<RunConfig>, build_tool: BuildTool, cancel: watch::Receiver<bool>) -> Self {
        Self {
            config,
            build_tool,
            cancel,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Runs `future` unless the cancel flag is raised first.
    async fn unless_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            () = cancelled(&mut cancel) => None,
            output = future => Some(output),
        }
    }

    /// The whole run: prepare, discover, partition, execute, aggregate.
    ///
    /// `runner` serves the coordinator's own processes; `make_runner` gives
    /// each worker a private one.
    pub async fn run(
        &self,
        runner: &mut dyn ProcessRunner,
        make_runner: impl Fn(usize) -> Box<dyn ProcessRunner>,
        cpus: usize,
    ) -> Result<RunOutcome, CoordinatorError> {
        let folders = trace_folder_count(cpus, self.config.max_jobs);
        artifacts::create_trace_folders(&self.config.replay_sample_folder, folders)?;

        let Some(prepared) = self.unless_cancelled(self.prepare_capture_build(runner)).await else {
            runner.kill_all().await;
            return Ok(RunOutcome::Interrupted);
        };
        if let Err(e) = prepared {
            runner.kill_all().await;
            return Err(e);
        }

        let Some(names) = self.unless_cancelled(self.discover_tests(runner)).await else {
            runner.kill_all().await;
            return Ok(RunOutcome::Interrupted);
        };
        let batches = partition(&names?, self.config.batch_count)?;

        let outcome = self.run_batches(batches, make_runner, cpus).await;
        runner.kill_all().await;
        Ok(outcome)
    }

    /// Generates and builds the capture-enabled test suite.
    pub async fn prepare_capture_build(&self, runner: &mut dyn ProcessRunner) -> Result<(), CoordinatorError> {
        let build_dir = self.config.capture_build_dir();
        info!(build_dir = %build_dir.display(), "Building capture test suite");

        let generated = self.build_tool.generate(runner, &build_dir, &[], false).await;
        if !generated.success() {
            return Err(CoordinatorError::CaptureBuild {
                step: "gn gen",
                output: generated.output,
            });
        }
        let built = self
            .build_tool
            .build(runner, &build_dir, &self.config.test_suite_binary(), false)
            .await;
        if !built.success() {
            return Err(CoordinatorError::CaptureBuild {
                step: "ninja",
                output: built.output,
            });
        }
        Ok(())
    }

    /// Lists the tests matching the filter, minus the expectations file's exclusions.
    pub async fn discover_tests(&self, runner: &mut dyn ProcessRunner) -> Result<Vec<String>, CoordinatorError> {
        let skip_list = self.load_skip_list()?;
        let test_exe = self
            .config
            .capture_build_dir()
            .join(self.config.test_suite_binary());
        let command = CommandSpec::new(test_exe)
            .arg("--list-tests")
            .arg(format!("--gtest_filter={}", self.config.gtest_filter));

        let outcome = runner.run(&command, self.config.subprocess_timeout()).await;
        if !outcome.success() {
            return Err(CoordinatorError::Discovery(outcome.output));
        }
        Ok(parse_test_list(&outcome.output, &skip_list).tests)
    }

    fn load_skip_list(&self) -> Result<SkipList, CoordinatorError> {
        let path = self.config.expectations_path();
        if !path.is_file() {
            debug!(path = %path.display(), "No expectations file");
            return Ok(SkipList::default());
        }
        SkipList::from_file(&path).map_err(|source| CoordinatorError::Expectations { path, source })
    }

    /// Runs `batches` on a pool of worker tasks and folds their results.
    pub async fn run_batches(
        &self,
        batches: Vec<TestBatch>,
        make_runner: impl Fn(usize) -> Box<dyn ProcessRunner>,
        cpus: usize,
    ) -> RunOutcome {
        let count = worker_count(cpus, self.config.max_jobs, batches.len());
        let queue = JobQueue::new(batches);
        let results = ResultLog::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let mut supervisor = ProcessGroup::new();

        info!(workers = count, batches = queue.len(), "Starting workers");
        for worker_id in 0..count {
            let ctx = WorkerContext::new(Arc::clone(&self.config), self.build_tool.clone(), worker_id);
            let worker = run_worker(
                ctx,
                make_runner(worker_id),
                queue.clone(),
                results.clone(),
                tx.clone(),
                self.cancel.clone(),
            );
            supervisor.add_worker(tokio::spawn(async move {
                worker.await;
            }));
        }
        drop(tx);

        let heartbeat = self.config.heartbeat_interval();
        let poll = self.config.poll_interval();
        let mut cancel = self.cancel.clone();
        let mut last_message = Instant::now();
        loop {
            while let Ok(message) = rx.try_recv() {
                log_message(&message);
                last_message = Instant::now();
            }
            if last_message.elapsed() >= heartbeat {
                info!(
                    "Tests are still running. Remaining workers: {}. Unstarted jobs: {}",
                    supervisor.remaining_workers(),
                    queue.len()
                );
                last_message = Instant::now();
            }
            if self.is_cancelled() {
                shutdown(&mut supervisor, poll).await;
                return RunOutcome::Interrupted;
            }
            if !supervisor.any_worker_alive() {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(poll) => {}
                () = cancelled(&mut cancel) => {}
            }
        }

        supervisor.join_workers().await;
        while let Ok(message) = rx.try_recv() {
            warn!("{message}");
        }
        if !queue.is_empty() {
            error!(unstarted = queue.len(), "Workers exited with batches still queued");
        }

        RunOutcome::Completed(AggregateReport::fold(&results.snapshot(), self.started_at))
    }
}

fn log_message(message: &WorkerMessage) {
    match message {
        WorkerMessage::Exception { .. } => warn!(worker = message.worker(), "{message}"),
        _ => info!(worker = message.worker(), "{message}"),
    }
}

/// Gives interrupted workers a moment to stop their processes, then aborts them.
async fn shutdown(supervisor: &mut ProcessGroup, poll: Duration) {
    info!("Interrupted; stopping workers");
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while supervisor.any_worker_alive() && Instant::now() < deadline {
        tokio::time::sleep(poll.min(Duration::from_millis(100))).await;
    }
    supervisor.kill_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use capreplay_proto::Error;
    use tempfile::TempDir;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("Suite.Test{i}/ES2_Vulkan")).collect()
    }

    fn coordinator(dir: &TempDir, cancel: watch::Receiver<bool>) -> Coordinator {
        let config = RunConfig {
            out_dir: dir.path().join("out"),
            replay_sample_folder: dir.path().join("sample"),
            poll_interval_ms: 10,
            ..RunConfig::default()
        };
        let tool = BuildTool::locate(Some(&dir.path().join("depot_tools")), false, None).unwrap();
        Coordinator::new(Arc::new(config), tool, cancel)
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(16, 8, 3), 3);
        assert_eq!(worker_count(4, 8, 10), 3);
        assert_eq!(worker_count(16, 2, 10), 2);
        assert_eq!(worker_count(1, 8, 5), 1);
        assert_eq!(worker_count(16, 8, 0), 0);
    }

    #[test]
    fn test_partition_round_robin() {
        let batches = partition(&names(10), 8).unwrap();
        assert_eq!(batches.len(), 2);
        let first: Vec<_> = batches[0].tests().iter().map(TestCase::full_name).collect();
        assert_eq!(first[..3], ["Suite.Test0/ES2_Vulkan", "Suite.Test2/ES2_Vulkan", "Suite.Test4/ES2_Vulkan"]);
        assert_eq!(batches[0].tests().len(), 5);
        assert_eq!(batches[1].tests().len(), 5);
    }

    #[test]
    fn test_partition_sizes() {
        assert_eq!(partition(&names(8), 8).unwrap().len(), 1);
        assert_eq!(partition(&names(9), 8).unwrap().len(), 2);
        assert!(partition(&[], 8).unwrap().is_empty());
        for batch in partition(&names(17), 4).unwrap() {
            assert!(batch.tests().len() <= 4);
        }
    }

    #[test]
    fn test_partition_rejects_duplicate_labels() {
        let names = vec!["A.b/C".to_string(), "A_b_C".to_string()];
        let err = partition(&names, 8).unwrap_err();
        assert!(matches!(err, Error::DuplicateLabel { .. }));
    }

    #[tokio::test]
    async fn test_run_batches_aggregates_all_workers() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let coordinator = coordinator(&dir, rx);
        artifacts::create_trace_folders(&dir.path().join("sample"), 3).unwrap();
        let script = ScriptedRunner::new().failing(["Suite.Test3/ES2_Vulkan"]);

        let batches = partition(&names(6), 2).unwrap();
        let outcome = coordinator
            .run_batches(batches, |_| Box::new(script.clone()), 4)
            .await;

        let RunOutcome::Completed(report) = outcome else {
            panic!("run was interrupted");
        };
        assert_eq!(report.counts.passed, 5);
        assert_eq!(report.fails, vec!["Suite.Test3/ES2_Vulkan"]);
        assert_eq!(report.exit_code(), 1);
        // One kill_all per worker on exit.
        assert_eq!(script.kill_count(), 3);
    }

    #[tokio::test]
    async fn test_run_batches_interrupt() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = watch::channel(false);
        let coordinator = coordinator(&dir, rx);
        artifacts::create_trace_folders(&dir.path().join("sample"), 1).unwrap();
        let script = ScriptedRunner::new().capture_delay(Duration::from_secs(30));

        let batches = partition(&names(4), 2).unwrap();
        let run = coordinator.run_batches(batches, |_| Box::new(script.clone()), 2);
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let (outcome, ()) = tokio::join!(run, interrupt);

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(script.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_discovery_applies_expectations() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let coordinator = coordinator(&dir, rx);
        std::fs::create_dir_all(dir.path().join("sample")).unwrap();
        std::fs::write(
            coordinator.config().expectations_path(),
            "# flaky\nSuite.Test1/*\n",
        )
        .unwrap();
        let mut runner = ScriptedRunner::new().with_test_list(names(3));

        let tests = coordinator.discover_tests(&mut runner).await.unwrap();

        assert_eq!(tests, vec!["Suite.Test0/ES2_Vulkan", "Suite.Test2/ES2_Vulkan"]);
        let commands = runner.commands();
        assert_eq!(
            commands[0].get_args(),
            ["--list-tests", "--gtest_filter=*/ES2_Vulkan"]
        );
    }

    #[tokio::test]
    async fn test_capture_build_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let coordinator = coordinator(&dir, rx);
        let mut runner = ScriptedRunner::new().ninja_status(capreplay_adapters::RunStatus::Failed);

        let result = coordinator
            .run(&mut runner, |_| Box::new(ScriptedRunner::new()), 4)
            .await;

        assert!(matches!(
            result,
            Err(CoordinatorError::CaptureBuild { step: "ninja", .. })
        ));
        let commands = runner.commands();
        assert!(!commands[1].captures_output());
    }
}
