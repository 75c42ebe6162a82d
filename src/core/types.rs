//! Core identifier types for the engine.
//!
//! These types provide type-safe identifiers for projects, jobs, invocations,
//! and the nonces that correlate state machine actions with their events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a project owning a set of jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(String);

/// Globally unique job identifier of the form `<project>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of a single invocation, unique within its parent job.
///
/// Generated from the creation time so that numerically smaller IDs are more
/// recent; see [`crate::core::invocation_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(i64);

/// Single-use correlation token emitted with a state machine action.
///
/// Always positive; an event carrying a nonce is only honoured while the job
/// state still expects that exact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(i64);

impl ProjectId {
    /// Create a new ProjectId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl JobId {
    /// Create a new JobId from a string.
    ///
    /// The value is not validated; use [`JobId::split`] to check the
    /// `<project>/<name>` shape.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a JobId from its project and job name.
    pub fn from_parts(project: &ProjectId, name: &str) -> Self {
        Self(format!("{}/{}", project.as_str(), name))
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into project and job name.
    ///
    /// Returns `None` unless the ID contains exactly one `/` with non-empty
    /// text on both sides.
    pub fn split(&self) -> Option<(ProjectId, &str)> {
        let (project, name) = self.0.split_once('/')?;
        if project.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some((ProjectId::new(project), name))
    }

    /// Get the project portion, if the ID is well formed.
    pub fn project(&self) -> Option<ProjectId> {
        self.split().map(|(project, _)| project)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl InvocationId {
    /// Wrap a raw identifier value.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw identifier value.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl Nonce {
    /// Wrap a raw nonce value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw nonce value.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
