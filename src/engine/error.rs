//! Engine error types.

use thiserror::Error;

use crate::core::schedule::ScheduleError;
use crate::core::types::{InvocationId, JobId, ProjectId};
use crate::executor::LaunchError;
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Errors that can occur in the engine.
///
/// Every error is either fatal or transient, see [`EngineError::is_transient`].
/// Callers redeliver a message only when the error is transient.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The job's schedule cannot be evaluated.
    #[error("bad schedule {expression:?}: {source}")]
    BadSchedule {
        expression: String,
        #[source]
        source: ScheduleError,
    },

    /// Job ID is not of the form `<project>/<name>`.
    #[error("invalid job id {0:?}, expected <project>/<name>")]
    InvalidJobId(String),

    /// A definition was submitted for another project.
    #[error("job {job_id} does not belong to project {project}")]
    WrongProject { job_id: JobId, project: ProjectId },

    /// A serialized action could not be decoded.
    #[error("malformed action payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    /// No free invocation ID was found.
    #[error("no free invocation id after {0} attempts")]
    IdExhausted(u32),

    /// The executor broke its contract.
    #[error("executor contract violation: {0}")]
    ContractViolation(String),

    /// A dev-server-only operation was called elsewhere.
    #[error("operation is only allowed on a dev server")]
    NotDevServer,

    /// An attempt to change an invocation that already finished.
    #[error("invocation {0} has already finished")]
    InvocationFinished(InvocationId),

    /// The executor failed to launch the payload.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Some of the per-job operations of a batch failed.
    #[error("{} job operation(s) failed: {}", .0.len(), summarize(.0))]
    Multiple(Vec<EngineError>),
}

impl EngineError {
    /// Check if this error is considered transient (should trigger redelivery).
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Launch(e) => e.is_transient(),
            EngineError::Storage(_) | EngineError::Queue(_) | EngineError::Multiple(_) => true,
            EngineError::BadSchedule { .. }
            | EngineError::InvalidJobId(_)
            | EngineError::WrongProject { .. }
            | EngineError::BadPayload(_)
            | EngineError::IdExhausted(_)
            | EngineError::ContractViolation(_)
            | EngineError::NotDevServer
            | EngineError::InvocationFinished(_) => false,
        }
    }
}

fn summarize(errors: &[EngineError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
