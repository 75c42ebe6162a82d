//! Wire format of delayed actions.

use serde::{Deserialize, Serialize};

use crate::core::types::{JobId, Nonce};

/// A serialized state machine action, as carried by the task queue.
///
/// Encoded as JSON with a `kind` discriminator:
///
/// ```json
/// {"kind": "TICK", "job_id": "p/j", "tick_nonce": 42}
/// {"kind": "START", "job_id": "p/j", "invocation_nonce": 43}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionPayload {
    /// Deliver a timer tick.
    Tick { job_id: JobId, tick_nonce: Nonce },
    /// Start an invocation.
    Start {
        job_id: JobId,
        invocation_nonce: Nonce,
    },
}

impl ActionPayload {
    /// The job this action is addressed to.
    pub fn job_id(&self) -> &JobId {
        match self {
            ActionPayload::Tick { job_id, .. } | ActionPayload::Start { job_id, .. } => job_id,
        }
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
