//! Progress messages sent from workers to the coordinator.

use std::fmt;

/// A progress report from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// A worker claimed a batch.
    Started {
        worker: usize,
        tests: usize,
        unstarted: usize,
    },
    /// A worker finished a batch; carries the rendered batch report.
    Finished { worker: usize, report: String },
    /// A batch hit an unexpected internal error.
    Exception { worker: usize, error: String },
}

impl WorkerMessage {
    /// Id of the worker that sent the message.
    pub fn worker(&self) -> usize {
        match self {
            WorkerMessage::Started { worker, .. }
            | WorkerMessage::Finished { worker, .. }
            | WorkerMessage::Exception { worker, .. } => *worker,
        }
    }
}

impl fmt::Display for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMessage::Started {
                worker,
                tests,
                unstarted,
            } => write!(
                f,
                "Starting {tests} tests on worker {worker}. Unstarted jobs: {unstarted}"
            ),
            WorkerMessage::Finished { report, .. } => f.write_str(report),
            WorkerMessage::Exception { error, .. } => write!(f, "RunTestsException: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_message_text() {
        let msg = WorkerMessage::Started {
            worker: 2,
            tests: 8,
            unstarted: 5,
        };
        assert_eq!(msg.to_string(), "Starting 8 tests on worker 2. Unstarted jobs: 5");
        assert_eq!(msg.worker(), 2);
    }

    #[test]
    fn test_exception_message_text() {
        let msg = WorkerMessage::Exception {
            worker: 0,
            error: "disk full".to_string(),
        };
        assert_eq!(msg.to_string(), "RunTestsException: disk full");
    }
}
