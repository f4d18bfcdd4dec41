//! Shared state between the coordinator and its workers.

use crate::batch::TestBatch;
use capreplay_proto::BatchResult;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
///
/// Workers catch their own panics, so a poisoned lock still guards
/// consistent data: every mutation here is a single push or pop.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// FIFO of batches not yet claimed by any worker.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    inner: Arc<Mutex<VecDeque<TestBatch>>>,
}

impl JobQueue {
    pub fn new(batches: impl IntoIterator<Item = TestBatch>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(batches.into_iter().collect())),
        }
    }

    /// Claims the next batch, with the number left behind it.
    pub fn pop(&self) -> Option<(TestBatch, usize)> {
        let mut queue = lock(&self.inner);
        let batch = queue.pop_front()?;
        Some((batch, queue.len()))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

/// Append-only collection of finished batch results.
#[derive(Debug, Clone, Default)]
pub struct ResultLog {
    inner: Arc<Mutex<Vec<BatchResult>>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: BatchResult) {
        lock(&self.inner).push(result);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Copies out every result recorded so far.
    pub fn snapshot(&self) -> Vec<BatchResult> {
        lock(&self.inner).clone()
    }
}
