//! Delayed delivery of serialized actions.
//!
//! The engine turns every state machine action into a [`DelayedTask`] and
//! hands it to a [`TaskQueue`]. Delivery is at-least-once: the queue may
//! deliver a task more than once, late, or out of order, and the engine
//! tolerates all of it by comparing nonces.

mod local;
mod memory;

pub use local::{LocalDispatcher, LocalQueue};
pub use memory::InMemoryQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Delivery channel of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Timer ticks, delivered at the tick instant.
    Timers,
    /// Invocation start requests, delivered shortly after being enqueued.
    Invocations,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Timers => f.write_str("timers"),
            Channel::Invocations => f.write_str("invocations"),
        }
    }
}

/// A serialized action waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedTask {
    /// Channel the task is delivered on.
    pub channel: Channel,
    /// Earliest delivery time.
    pub eta: DateTime<Utc>,
    /// Serialized action.
    pub payload: Vec<u8>,
}

/// Errors that can occur when enqueueing tasks.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The receiving side is gone.
    #[error("queue closed")]
    Closed,

    /// The queue refused the tasks.
    #[error("enqueue rejected: {0}")]
    Rejected(String),
}

/// Delayed-delivery queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a batch of tasks. All tasks of one call share a channel.
    async fn enqueue(&self, tasks: Vec<DelayedTask>) -> Result<(), QueueError>;
}
