//! The worker loop: claim a batch, run its pipeline, report, repeat.

use crate::batch::WorkerContext;
use crate::queue::{JobQueue, ResultLog};
use capreplay_adapters::ProcessRunner;
use capreplay_proto::WorkerMessage;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// How a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue ran dry.
    Completed,
    /// The cancel flag was raised.
    Interrupted,
}

/// Resolves once `cancel` reads true. Never resolves if the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Processes batches from `queue` until it is empty or `cancel` is raised.
///
/// Unexpected errors and panics inside a batch are reported as
/// [`WorkerMessage::Exception`]; the batch's unclassified tests are recorded as
/// crashed and the loop moves on. The runner's processes are always killed
/// before returning.
pub async fn run_worker(
    mut ctx: WorkerContext,
    mut runner: Box<dyn ProcessRunner>,
    queue: JobQueue,
    results: ResultLog,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    mut cancel: watch::Receiver<bool>,
) -> WorkerExit {
    let worker = ctx.worker_id;
    let verbose = ctx.config.verbose;

    let exit = loop {
        if *cancel.borrow() {
            break WorkerExit::Interrupted;
        }
        let Some((mut batch, unstarted)) = queue.pop() else {
            break WorkerExit::Completed;
        };
        let _ = messages.send(WorkerMessage::Started {
            worker,
            tests: batch.tests().len(),
            unstarted,
        });

        let outcome = {
            let pipeline = AssertUnwindSafe(batch.run(&mut ctx, runner.as_mut())).catch_unwind();
            tokio::select! {
                () = cancelled(&mut cancel) => None,
                outcome = pipeline => Some(outcome),
            }
        };
        let Some(outcome) = outcome else {
            info!(worker, "Interrupted; stopping worker");
            break WorkerExit::Interrupted;
        };

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(failure) = failure {
            error!(worker, error = %failure, "Batch failed unexpectedly");
            let _ = messages.send(WorkerMessage::Exception {
                worker,
                error: failure.clone(),
            });
            runner.kill_all().await;
            batch.record_unclassified(&format!("Unexpected error: {failure}"), "");
        }

        let result = batch.batch_result(verbose);
        let report = result.to_string();
        results.push(result);
        let _ = messages.send(WorkerMessage::Finished { worker, report });
    };

    runner.kill_all().await;
    debug!(worker, ?exit, "Worker exiting");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::TestBatch;
    use crate::config::RunConfig;
    use crate::testing::ScriptedRunner;
    use capreplay_adapters::BuildTool;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> WorkerContext {
        let config = RunConfig {
            out_dir: dir.path().join("out"),
            replay_sample_folder: dir.path().join("sample"),
            ..RunConfig::default()
        };
        std::fs::create_dir_all(config.trace_folder_path(0)).unwrap();
        let tool = BuildTool::locate(Some(&dir.path().join("depot_tools")), false, None).unwrap();
        WorkerContext::new(Arc::new(config), tool, 0)
    }

    fn queue(batches: &[&[&str]]) -> JobQueue {
        JobQueue::new(batches.iter().map(|names| {
            let mut batch = TestBatch::new();
            for name in *names {
                batch.add_test(name);
            }
            batch
        }))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let queue = queue(&[&["A.b/C"], &["A.d/C", "A.e/C"]]);
        let results = ResultLog::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let exit = run_worker(
            context(&dir),
            Box::new(runner.clone()),
            queue.clone(),
            results.clone(),
            tx,
            cancel_rx,
        )
        .await;

        assert_eq!(exit, WorkerExit::Completed);
        assert!(queue.is_empty());
        assert_eq!(results.len(), 2);
        assert_eq!(runner.kill_count(), 1);

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[0],
            WorkerMessage::Started {
                worker: 0,
                tests: 1,
                unstarted: 1
            }
        );
        assert!(matches!(messages[1], WorkerMessage::Finished { .. }));
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_tests_crash() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().panic_on_capture();
        let results = ResultLog::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let exit = run_worker(
            context(&dir),
            Box::new(runner.clone()),
            queue(&[&["A.b/C", "A.d/C"]]),
            results.clone(),
            tx,
            cancel_rx,
        )
        .await;

        assert_eq!(exit, WorkerExit::Completed);
        let batch = &results.snapshot()[0];
        assert_eq!(batch.crashes, vec!["A.b/C", "A.d/C"]);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|m| matches!(m, WorkerMessage::Exception { .. }))
        );
        // Once for the failed batch, once on exit.
        assert_eq!(runner.kill_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_error_crashes_tests_and_worker_moves_on() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        // Kept files skip the folder clear, so the next capture recreates it.
        ctx.config = Arc::new(RunConfig {
            keep_temp_files: true,
            ..(*ctx.config).clone()
        });
        let runner = ScriptedRunner::new().removes_trace_folder(["A.b/C"]);
        let results = ResultLog::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let exit = run_worker(
            ctx,
            Box::new(runner.clone()),
            queue(&[&["A.b/C", "A.d/C"], &["A.e/C"]]),
            results.clone(),
            tx,
            cancel_rx,
        )
        .await;

        assert_eq!(exit, WorkerExit::Completed);
        let batches = results.snapshot();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].crashes, vec!["A.b/C", "A.d/C"]);
        assert_eq!(batches[1].passes, vec!["A.e/C"]);

        let messages = drain(&mut rx);
        let errors: Vec<&String> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Exception { error, .. } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("traces0"), "{}", errors[0]);
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::Finished { report, .. } if report.contains("Crashed: Unexpected error: Artifact I/O on")
        )));
        assert_eq!(runner.kill_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&[&["A.b/C"]]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(true);

        let exit = run_worker(
            context(&dir),
            Box::new(ScriptedRunner::new()),
            queue.clone(),
            ResultLog::new(),
            tx,
            cancel_rx,
        )
        .await;

        assert_eq!(exit, WorkerExit::Interrupted);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_capture() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().capture_delay(Duration::from_secs(30));
        let results = ResultLog::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(run_worker(
            context(&dir),
            Box::new(runner.clone()),
            queue(&[&["A.b/C"], &["A.d/C"]]),
            results.clone(),
            tx,
            cancel_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Interrupted);
        assert!(results.is_empty());
        assert_eq!(runner.kill_count(), 1);
    }
}
