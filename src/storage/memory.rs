//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.
//! Each job's entity group carries a version number; a transaction remembers
//! the version it started from and its commit is rejected with
//! [`StorageError::Contention`] if the group moved on in the meantime.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::{InvocationRecord, JobRecord, Storage, StorageError, Transaction};
use crate::core::types::{InvocationId, JobId, ProjectId};

#[derive(Default)]
struct Group {
    version: u64,
    job: Option<JobRecord>,
    invocations: BTreeMap<InvocationId, InvocationRecord>,
}

#[derive(Default)]
struct Shared {
    groups: RwLock<HashMap<JobId, Group>>,
    injected_contention: AtomicU32,
    injected_failures: AtomicU32,
    job_writes: AtomicU64,
    invocation_writes: AtomicU64,
}

impl Shared {
    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory storage backend.
///
/// Data is not persisted across restarts. Cloning yields another handle to
/// the same data.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    shared: Arc<Shared>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`StorageError::Contention`].
    pub fn inject_contention(&self, n: u32) {
        self.shared.injected_contention.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail with [`StorageError::CommitFailed`].
    pub fn inject_commit_failures(&self, n: u32) {
        self.shared.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Number of committed job record writes so far.
    pub fn job_writes(&self) -> u64 {
        self.shared.job_writes.load(Ordering::SeqCst)
    }

    /// Number of committed invocation record writes so far.
    pub fn invocation_writes(&self) -> u64 {
        self.shared.invocation_writes.load(Ordering::SeqCst)
    }

    /// Write a job record directly, bypassing transactions.
    pub fn insert_job(&self, job: JobRecord) -> Result<(), StorageError> {
        let mut groups = self
            .shared
            .groups
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let group = groups.entry(job.job_id.clone()).or_default();
        group.version += 1;
        group.job = Some(job);
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn begin(&self, job_id: &JobId) -> Result<Box<dyn Transaction>, StorageError> {
        let groups = self
            .shared
            .groups
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let (version, job) = groups
            .get(job_id)
            .map(|g| (g.version, g.job.clone()))
            .unwrap_or((0, None));
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            job_id: job_id.clone(),
            version,
            job,
            job_write: None,
            invocation_writes: BTreeMap::new(),
        }))
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, StorageError> {
        let groups = self
            .shared
            .groups
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(groups.get(job_id).and_then(|g| g.job.clone()))
    }

    async fn list_enabled_jobs(
        &self,
        project: Option<&ProjectId>,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let groups = self
            .shared
            .groups
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = groups
            .values()
            .filter_map(|g| g.job.as_ref())
            .filter(|j| j.enabled)
            .filter(|j| project.is_none_or(|p| &j.project_id == p))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(result)
    }

    async fn get_invocation(
        &self,
        job_id: &JobId,
        id: InvocationId,
    ) -> Result<Option<InvocationRecord>, StorageError> {
        let groups = self
            .shared
            .groups
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(groups
            .get(job_id)
            .and_then(|g| g.invocations.get(&id).cloned()))
    }

    async fn list_invocations(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<InvocationRecord>, StorageError> {
        let groups = self
            .shared
            .groups
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        // Identifiers decrease over time, so ascending order is most recent first.
        Ok(groups
            .get(job_id)
            .map(|g| g.invocations.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    job_id: JobId,
    version: u64,
    job: Option<JobRecord>,
    job_write: Option<JobRecord>,
    invocation_writes: BTreeMap<InvocationId, InvocationRecord>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn job(&self) -> Option<&JobRecord> {
        self.job.as_ref()
    }

    async fn get_invocation(
        &mut self,
        id: InvocationId,
    ) -> Result<Option<InvocationRecord>, StorageError> {
        if let Some(buffered) = self.invocation_writes.get(&id) {
            return Ok(Some(buffered.clone()));
        }
        let groups = self
            .shared
            .groups
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(groups
            .get(&self.job_id)
            .and_then(|g| g.invocations.get(&id).cloned()))
    }

    fn put_job(&mut self, job: JobRecord) {
        self.job_write = Some(job);
    }

    fn put_invocation(&mut self, invocation: InvocationRecord) {
        self.invocation_writes.insert(invocation.id, invocation);
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        if Shared::take_injected(&this.shared.injected_contention) {
            return Err(StorageError::Contention(format!("job: {}", this.job_id)));
        }
        if Shared::take_injected(&this.shared.injected_failures) {
            return Err(StorageError::CommitFailed("injected failure".into()));
        }
        if this.job_write.is_none() && this.invocation_writes.is_empty() {
            return Ok(());
        }

        let mut groups = this
            .shared
            .groups
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let group = groups.entry(this.job_id.clone()).or_default();
        if group.version != this.version {
            return Err(StorageError::Contention(format!("job: {}", this.job_id)));
        }

        group.version += 1;
        if let Some(job) = this.job_write {
            group.job = Some(job);
            this.shared.job_writes.fetch_add(1, Ordering::SeqCst);
        }
        let written = this.invocation_writes.len() as u64;
        group.invocations.extend(this.invocation_writes);
        this.shared
            .invocation_writes
            .fetch_add(written, Ordering::SeqCst);
        Ok(())
    }
}
