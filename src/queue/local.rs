//! In-process delayed delivery on top of tokio.
//!
//! [`LocalQueue`] pushes tasks into an unbounded channel; [`LocalDispatcher`]
//! drains it, waits for each task's ETA and feeds the payload back into
//! [`Engine::execute_serialized_action`]. Transient failures are redelivered
//! with capped exponential backoff, one attempt at a time per task. Fatal
//! failures are logged and dropped.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::{DelayedTask, QueueError, TaskQueue};
use crate::engine::Engine;

/// Default number of delivery attempts per task.
const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Sending half of the local queue.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<DelayedTask>,
}

impl LocalQueue {
    /// Create a queue and the receiver to hand to a [`LocalDispatcher`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DelayedTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, tasks: Vec<DelayedTask>) -> Result<(), QueueError> {
        for task in tasks {
            self.tx.send(task).map_err(|_| QueueError::Closed)?;
        }
        Ok(())
    }
}

/// Redelivery schedule for transient failures.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    /// Delay before redelivering after the given (zero-based) attempt failed.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Delivers tasks from a [`LocalQueue`] back into the engine.
pub struct LocalDispatcher {
    engine: Engine,
    rx: mpsc::UnboundedReceiver<DelayedTask>,
    backoff: Backoff,
}

impl LocalDispatcher {
    /// Create a dispatcher feeding `engine` from `rx`.
    pub fn new(engine: Engine, rx: mpsc::UnboundedReceiver<DelayedTask>) -> Self {
        Self {
            engine,
            rx,
            backoff: Backoff {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                initial: Duration::from_millis(100),
                max: Duration::from_secs(60),
            },
        }
    }

    /// Set the number of delivery attempts per task.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.backoff.max_attempts = attempts.max(1);
        self
    }

    /// Set the initial and maximum redelivery delay.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff.initial = initial;
        self.backoff.max = max;
        self
    }

    /// Deliver tasks until `shutdown` resolves.
    ///
    /// Tasks still waiting for their ETA are abandoned on shutdown. That is
    /// safe as long as the queue is not the only record of pending work,
    /// which for this in-process queue means the next
    /// [`Engine::update_project_jobs`] or reset has to re-arm them.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut in_flight = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(pending = in_flight.len(), "Dispatcher shutting down");
                    in_flight.abort_all();
                    break;
                }
                task = self.rx.recv() => match task {
                    Some(task) => {
                        in_flight.spawn(deliver(self.engine.clone(), self.backoff, task));
                    }
                    None => {
                        while let Some(result) = in_flight.join_next().await {
                            log_join_error(result);
                        }
                        break;
                    }
                },
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_error(result);
                }
            }
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        tracing::error!(error = %e, "Delivery task panicked");
    }
}

async fn deliver(engine: Engine, backoff: Backoff, task: DelayedTask) {
    let delay = (task.eta - engine.now()).to_std().unwrap_or(Duration::ZERO);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut attempt = 0;
    loop {
        match engine.execute_serialized_action(&task.payload, attempt).await {
            Ok(()) => return,
            Err(e) if e.is_transient() && attempt + 1 < backoff.max_attempts => {
                let wait = backoff.delay(attempt);
                tracing::warn!(
                    channel = %task.channel,
                    attempt,
                    error = %e,
                    retry_in = ?wait,
                    "Delivery failed, will redeliver"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    channel = %task.channel,
                    attempt,
                    error = %e,
                    transient = e.is_transient(),
                    "Dropping task"
                );
                return;
            }
        }
    }
}
