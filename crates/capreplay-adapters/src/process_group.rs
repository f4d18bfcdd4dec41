//! Supervisor for every child process and worker task spawned by one owner.
//!
//! The coordinator and each worker own a `ProcessGroup`. A process lives in
//! the group only for the duration of [`ProcessGroup::run`]; anything still
//! registered when the owner is interrupted is torn down by
//! [`ProcessGroup::kill_all`].

use crate::{CommandSpec, ManagedProcess, WaitError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Status of a supervised run, collapsed to the three cases the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Exit code 0.
    Success,
    /// Nonzero exit, death by signal, or failure to launch or wait.
    Failed,
    /// Still running when the timeout elapsed; the process was killed.
    TimedOut,
}

impl RunStatus {
    /// Numeric status: 0 success, -1 failure, -2 timeout.
    pub fn code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => -1,
            RunStatus::TimedOut => -2,
        }
    }
}

/// Status plus whatever text the run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub status: RunStatus,
    /// Captured output, or the error description when the run itself failed.
    pub output: String,
}

impl ProcessOutcome {
    pub fn new(status: RunStatus, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Anything that can run commands with a timeout and tear them all down.
///
/// Implementations never return errors from `run`: every failure is folded
/// into the returned [`RunStatus`] so one bad process cannot abort a batch.
#[async_trait]
pub trait ProcessRunner: Send {
    /// Runs `command` to completion or until `timeout` elapses.
    async fn run(&mut self, command: &CommandSpec, timeout: Option<Duration>) -> ProcessOutcome;

    /// Kills every process this runner still tracks.
    async fn kill_all(&mut self);
}

/// Tracks live child processes (by pid) and long-lived worker tasks.
#[derive(Debug, Default)]
pub struct ProcessGroup {
    processes: HashMap<u32, ManagedProcess>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `command`, then removes and kills it whatever the outcome.
    pub async fn run(&mut self, command: &CommandSpec, timeout: Option<Duration>) -> ProcessOutcome {
        let process = match ManagedProcess::start(command) {
            Ok(process) => process,
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to start process");
                return ProcessOutcome::new(RunStatus::Failed, e.to_string());
            }
        };
        let pid = process.id();
        debug!(pid, command = %command, "Created subprocess");

        let joined = self.processes.entry(pid).or_insert(process).join(timeout).await;
        self.remove_process(pid).await;

        match joined {
            Ok(exit) if exit.success => ProcessOutcome::new(RunStatus::Success, exit.output),
            Ok(exit) => {
                debug!(pid, code = ?exit.code, "Process exited with failure");
                ProcessOutcome::new(RunStatus::Failed, exit.output)
            }
            Err(e @ WaitError::TimedOut(_)) => {
                warn!(pid, command = %command, "Process timed out");
                ProcessOutcome::new(RunStatus::TimedOut, e.to_string())
            }
            Err(e @ WaitError::Io(_)) => ProcessOutcome::new(RunStatus::Failed, e.to_string()),
        }
    }

    async fn remove_process(&mut self, pid: u32) {
        if let Some(mut process) = self.processes.remove(&pid)
            && let Err(e) = process.kill().await
        {
            warn!(pid, error = %e, "Failed to kill process");
        }
    }

    /// Number of processes currently registered.
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Registers a worker task for later joining.
    pub fn add_worker(&mut self, worker: JoinHandle<()>) {
        self.workers.push(worker);
    }

    /// Kills every tracked process and aborts every tracked worker.
    ///
    /// Calling it again, or on an empty group, does nothing.
    pub async fn kill_all(&mut self) {
        for (pid, mut process) in self.processes.drain() {
            if let Err(e) = process.kill().await {
                warn!(pid, error = %e, "Failed to kill process");
            }
        }
        for worker in self.workers.drain(..) {
            worker.abort();
            if let Err(e) = worker.await
                && e.is_panic()
            {
                warn!(error = %e, "Worker panicked");
            }
        }
    }

    /// Waits for every tracked worker to finish.
    pub async fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker did not finish cleanly");
            }
        }
    }

    /// Whether any tracked worker is still running.
    pub fn any_worker_alive(&self) -> bool {
        self.workers.iter().any(|worker| !worker.is_finished())
    }

    /// Number of tracked workers still running.
    pub fn remaining_workers(&self) -> usize {
        self.workers.iter().filter(|worker| !worker.is_finished()).count()
    }
}

#[async_trait]
impl ProcessRunner for ProcessGroup {
    async fn run(&mut self, command: &CommandSpec, timeout: Option<Duration>) -> ProcessOutcome {
        ProcessGroup::run(self, command, timeout).await
    }

    async fn kill_all(&mut self) {
        ProcessGroup::kill_all(self).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RunStatus::Success.code(), 0);
        assert_eq!(RunStatus::Failed.code(), -1);
        assert_eq!(RunStatus::TimedOut.code(), -2);
    }

    #[tokio::test]
    async fn test_run_success_returns_output() {
        let mut group = ProcessGroup::new();
        let outcome = group.run(&CommandSpec::new("echo").arg("hi"), None).await;

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.output, "hi\n");
        assert_eq!(group.process_count(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_maps_to_failed() {
        let mut group = ProcessGroup::new();
        let outcome = group.run(&CommandSpec::new("false"), None).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.status.code(), -1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timed_out_and_cleans_up() {
        let mut group = ProcessGroup::new();
        let outcome = group
            .run(
                &CommandSpec::new("sleep").arg("10"),
                Some(Duration::from_millis(100)),
            )
            .await;

        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert_eq!(outcome.status.code(), -2);
        assert_eq!(group.process_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_propagated() {
        let mut group = ProcessGroup::new();
        let outcome = group
            .run(&CommandSpec::new("/nonexistent/capreplay-binary"), None)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.output.is_empty());
    }

    #[tokio::test]
    async fn test_worker_tracking() {
        let mut group = ProcessGroup::new();
        group.add_worker(tokio::spawn(async {}));
        group.add_worker(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(group.any_worker_alive());
        assert_eq!(group.remaining_workers(), 1);

        group.kill_all().await;
        assert!(!group.any_worker_alive());
        assert_eq!(group.remaining_workers(), 0);

        // Reentrant.
        group.kill_all().await;
    }

    #[tokio::test]
    async fn test_join_workers_waits_for_completion() {
        let mut group = ProcessGroup::new();
        group.add_worker(tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }));

        group.join_workers().await;
        assert_eq!(group.remaining_workers(), 0);
    }
}
