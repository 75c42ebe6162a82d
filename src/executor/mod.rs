//! Executor plugins.
//!
//! An [`Executor`] runs the opaque payload of a job. It receives an
//! [`InvocationController`] for the invocation being launched and must move
//! the invocation out of STARTING before `launch` returns, either by saving
//! RUNNING (the payload keeps going in the background) or a terminal status
//! (it finished synchronously).

mod command;

pub use command::{CommandExecutor, CommandPayload};

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::{EngineError, InvocationController};

/// Errors an executor can report from `launch`.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The launch may succeed if retried.
    #[error("transient launch failure: {0}")]
    Transient(String),

    /// The launch will not succeed if retried.
    #[error("launch failed: {0}")]
    Fatal(String),

    /// The payload is not something this executor understands.
    #[error("malformed payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    /// Saving the invocation through the controller failed.
    #[error("invocation update failed: {0}")]
    Update(#[source] Box<EngineError>),
}

impl LaunchError {
    /// Check if this error is considered transient (should trigger redelivery).
    pub fn is_transient(&self) -> bool {
        match self {
            LaunchError::Transient(_) => true,
            LaunchError::Fatal(_) | LaunchError::BadPayload(_) => false,
            LaunchError::Update(e) => e.is_transient(),
        }
    }
}

impl From<EngineError> for LaunchError {
    fn from(e: EngineError) -> Self {
        LaunchError::Update(Box::new(e))
    }
}

/// Runs job payloads.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch the payload of the invocation owned by `ctl`.
    ///
    /// # Returns
    /// * `Ok(())` - The invocation left STARTING
    /// * `Err(LaunchError)` - The launch failed; the engine records the
    ///   invocation as FAILED and decides whether to reschedule the job
    async fn launch(&self, payload: &[u8], ctl: &mut InvocationController)
    -> Result<(), LaunchError>;
}
