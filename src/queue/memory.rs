//! Recording queue for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{Channel, DelayedTask, QueueError, TaskQueue};

/// Queue that only records what was enqueued.
///
/// Cloning yields another handle to the same recording.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    tasks: Arc<Mutex<Vec<DelayedTask>>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` enqueue calls fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Everything enqueued so far, in order.
    pub fn tasks(&self) -> Vec<DelayedTask> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Tasks enqueued on one channel.
    pub fn tasks_on(&self, channel: Channel) -> Vec<DelayedTask> {
        self.tasks()
            .into_iter()
            .filter(|t| t.channel == channel)
            .collect()
    }

    /// Remove and return everything enqueued so far.
    pub fn drain(&self) -> Vec<DelayedTask> {
        self.tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default()
    }

    /// Append tasks to the recording without going through `enqueue`.
    pub fn push(&self, tasks: Vec<DelayedTask>) {
        if let Ok(mut recorded) = self.tasks.lock() {
            recorded.extend(tasks);
        }
    }

    /// Number of tasks enqueued so far.
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Whether nothing was enqueued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, tasks: Vec<DelayedTask>) -> Result<(), QueueError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Rejected("injected failure".into()));
        }
        let mut recorded = self
            .tasks
            .lock()
            .map_err(|_| QueueError::Rejected("queue lock poisoned".into()))?;
        recorded.extend(tasks);
        Ok(())
    }
}
