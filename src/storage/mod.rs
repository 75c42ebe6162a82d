//! Storage abstraction for job and invocation records.
//!
//! A job record and its invocation records form one entity group. The only
//! coordination primitive the engine relies on is a transaction scoped to a
//! single entity group: reads inside it see a consistent snapshot, writes are
//! buffered, and [`Transaction::commit`] fails with
//! [`StorageError::Contention`] if anything in the group changed since the
//! transaction began.

mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::state::JobState;
use crate::core::types::{InvocationId, JobId, Nonce, ProjectId};

/// Marker appended once the debug log reaches its size limit.
pub const TRUNCATION_MARKER: &str = "\n<truncated>\n";

/// Default debug log limit in bytes, marker included.
pub const DEFAULT_DEBUG_LOG_LIMIT: usize = 32 * 1024;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A concurrent transaction modified the same entity group.
    #[error("concurrent modification of {0}")]
    Contention(String),

    /// The commit itself failed.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, StorageError::Contention(_))
    }
}

/// Status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    /// Record created, executor not yet confirmed the launch.
    Starting,
    /// Executor reported the payload as running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed to launch or finished with an error.
    Failed,
    /// Stopped before finishing.
    Aborted,
}

impl InvocationStatus {
    /// Whether no further changes are permitted.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded | InvocationStatus::Failed | InvocationStatus::Aborted
        )
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationStatus::Starting => "STARTING",
            InvocationStatus::Running => "RUNNING",
            InvocationStatus::Succeeded => "SUCCEEDED",
            InvocationStatus::Failed => "FAILED",
            InvocationStatus::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Last known definition of a job plus its state machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// `<project>/<name>`, immutable.
    pub job_id: JobId,
    /// Project portion of the job ID, kept for queries.
    pub project_id: ProjectId,
    /// False once the job was disabled or removed from the config.
    pub enabled: bool,
    /// Last applied config revision.
    pub revision: String,
    /// Cron expression.
    pub schedule: String,
    /// Opaque payload handed to the executor.
    pub payload: Vec<u8>,
    /// State machine state.
    pub state: JobState,
}

impl JobRecord {
    /// Create a disabled record with an empty definition.
    pub fn new(job_id: JobId, project_id: ProjectId) -> Self {
        Self {
            job_id,
            project_id,
            enabled: false,
            revision: String::new(),
            schedule: String::new(),
            payload: Vec::new(),
            state: JobState::default(),
        }
    }
}

/// One attempt to run a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Time-derived identifier, unique within the job.
    pub id: InvocationId,
    /// Owning job.
    pub job_id: JobId,
    /// When the record was created.
    pub started_at: DateTime<Utc>,
    /// When the record reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Start request this attempt belongs to.
    pub invocation_nonce: Nonce,
    /// Config revision at creation time.
    pub revision: String,
    /// Payload at creation time.
    pub payload: Vec<u8>,
    /// Bounded free-form log.
    pub debug_log: String,
    /// Delivery attempt that created this record (0 on the first).
    pub retry_count: u32,
    /// Current status.
    pub status: InvocationStatus,
}

impl InvocationRecord {
    /// Create a record in STARTING for the given job snapshot.
    pub fn starting(
        id: InvocationId,
        job: &JobRecord,
        nonce: Nonce,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id: job.job_id.clone(),
            started_at: now,
            finished_at: None,
            invocation_nonce: nonce,
            revision: job.revision.clone(),
            payload: job.payload.clone(),
            debug_log: String::new(),
            retry_count,
            status: InvocationStatus::Starting,
        }
    }

    /// Append a timestamped line to the debug log.
    ///
    /// The log never grows beyond `limit` bytes: the line that would cross
    /// the limit is cut and followed by [`TRUNCATION_MARKER`], after which
    /// nothing more is appended.
    pub fn append_debug_log(&mut self, now: DateTime<Utc>, limit: usize, message: &str) {
        if self.debug_log.ends_with(TRUNCATION_MARKER) {
            return;
        }
        let line = format!("{}{}\n", now.format("[%H:%M:%S%.3f] "), message);
        if self.debug_log.len() + line.len() <= limit {
            self.debug_log.push_str(&line);
            return;
        }
        self.debug_log.push_str(&line);
        let mut cut = limit.saturating_sub(TRUNCATION_MARKER.len());
        while !self.debug_log.is_char_boundary(cut) {
            cut -= 1;
        }
        self.debug_log.truncate(cut);
        self.debug_log.push_str(TRUNCATION_MARKER);
    }
}

/// A transaction over one job's entity group.
///
/// Writes are buffered until [`Transaction::commit`]; reads observe the
/// transaction's own buffered writes.
#[async_trait]
pub trait Transaction: Send {
    /// The job record as of the start of the transaction.
    fn job(&self) -> Option<&JobRecord>;

    /// Read an invocation of this job.
    async fn get_invocation(
        &mut self,
        id: InvocationId,
    ) -> Result<Option<InvocationRecord>, StorageError>;

    /// Buffer a write of the job record.
    fn put_job(&mut self, job: JobRecord);

    /// Buffer a write of an invocation of this job.
    fn put_invocation(&mut self, invocation: InvocationRecord);

    /// Atomically apply all buffered writes.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Storage trait for persisting engine state.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Begin a transaction over the entity group of `job_id`.
    async fn begin(&self, job_id: &JobId) -> Result<Box<dyn Transaction>, StorageError>;

    /// Get a job record.
    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, StorageError>;

    /// List enabled jobs, optionally restricted to one project.
    async fn list_enabled_jobs(
        &self,
        project: Option<&ProjectId>,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Get an invocation record.
    async fn get_invocation(
        &self,
        job_id: &JobId,
        id: InvocationId,
    ) -> Result<Option<InvocationRecord>, StorageError>;

    /// List invocations of a job, most recent first.
    /// Returns at most `limit` records.
    async fn list_invocations(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<InvocationRecord>, StorageError>;
}
