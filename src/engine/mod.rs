//! Cron engine.
//!
//! The engine is purely reactive: there is no scheduling loop. Every entry
//! point runs one or more job-scoped transactions that feed events to the
//! job's state machine, persist the result and enqueue the emitted actions
//! as delayed tasks. The task queue later calls back into
//! [`Engine::execute_serialized_action`], which closes the loop.
//!
//! Jobs never share a transaction. Batch operations fan out one future per
//! job and join them.

mod action;
mod controller;
mod error;
mod txn;

pub use action::ActionPayload;
pub use controller::InvocationController;
pub use error::EngineError;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::{EngineConfig, Environment};
use crate::core::clock::{Clock, Entropy, SystemClock, ThreadEntropy};
use crate::core::state::JobEvent;
use crate::core::types::{InvocationId, JobId, Nonce, ProjectId};
use crate::executor::Executor;
use crate::queue::TaskQueue;
use crate::storage::{InvocationRecord, InvocationStatus, JobRecord, Storage};
use txn::TxnOutcome;

/// Desired state of one job, as produced by the config loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// `<project>/<name>`.
    pub job_id: JobId,
    /// Revision of the config the definition came from.
    pub revision: String,
    /// Cron expression.
    pub schedule: String,
    /// Opaque payload handed to the executor.
    pub payload: Vec<u8>,
}

pub(crate) struct EngineInner {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) entropy: Arc<dyn Entropy>,
    pub(crate) config: EngineConfig,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn Entropy>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Set the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the source of nonces and identifier randomness.
    pub fn entropy(mut self, entropy: Arc<dyn Entropy>) -> Self {
        self.entropy = entropy;
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                storage: self.storage,
                queue: self.queue,
                executor: self.executor,
                clock: self.clock,
                entropy: self.entropy,
                config: self.config,
            }),
        }
    }
}

impl Engine {
    /// Start building an engine on top of the given collaborators.
    ///
    /// Defaults to the wall clock, thread-local randomness and
    /// [`EngineConfig::default`].
    pub fn builder(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn TaskQueue>,
        executor: Arc<dyn Executor>,
    ) -> EngineBuilder {
        EngineBuilder {
            storage,
            queue,
            executor,
            clock: Arc::new(SystemClock),
            entropy: Arc::new(ThreadEntropy),
            config: EngineConfig::default(),
        }
    }

    /// Current time according to the engine's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Projects that have at least one enabled job, sorted.
    pub async fn get_all_projects(&self) -> Result<Vec<ProjectId>, EngineError> {
        let jobs = self.inner.storage.list_enabled_jobs(None).await?;
        let projects: BTreeSet<ProjectId> = jobs.into_iter().map(|j| j.project_id).collect();
        Ok(projects.into_iter().collect())
    }

    /// Bring the jobs of `project` in line with `definitions`.
    ///
    /// Jobs in `definitions` are created or updated, enabled jobs of the
    /// project missing from it are disabled. Every job is handled in its own
    /// transaction, concurrently with the others; a failure of one job does
    /// not prevent the others from being updated.
    pub async fn update_project_jobs(
        &self,
        project: &ProjectId,
        definitions: &[JobDefinition],
    ) -> Result<(), EngineError> {
        let existing = self.inner.storage.list_enabled_jobs(Some(project)).await?;

        let mut errors = Vec::new();
        let mut wanted = HashSet::new();
        let mut pending: Vec<BoxFuture<'_, Result<(), EngineError>>> = Vec::new();

        for def in definitions {
            match def.job_id.project() {
                Some(owner) if &owner == project => {
                    wanted.insert(&def.job_id);
                    pending.push(Box::pin(self.update_job(def)));
                }
                Some(_) => errors.push(EngineError::WrongProject {
                    job_id: def.job_id.clone(),
                    project: project.clone(),
                }),
                None => errors.push(EngineError::InvalidJobId(def.job_id.to_string())),
            }
        }
        for job in &existing {
            if !wanted.contains(&job.job_id) {
                pending.push(Box::pin(self.disable_job(&job.job_id)));
            }
        }

        tracing::info!(
            project = %project,
            definitions = definitions.len(),
            enabled = existing.len(),
            "Updating project jobs"
        );
        errors.extend(join_all(pending).await.into_iter().filter_map(Result::err));

        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                tracing::error!(project = %project, error = %e, "Failed to update job");
            }
            Err(EngineError::Multiple(errors))
        }
    }

    /// Disable and re-enable every enabled job, dropping pending ticks and
    /// starts. Only allowed on a dev server.
    pub async fn reset_all_jobs_on_dev_server(&self) -> Result<(), EngineError> {
        if self.inner.config.environment != Environment::DevServer {
            return Err(EngineError::NotDevServer);
        }
        let jobs = self.inner.storage.list_enabled_jobs(None).await?;
        tracing::info!(jobs = jobs.len(), "Resetting all jobs");
        let results = join_all(jobs.iter().map(|job| self.reset_job(&job.job_id))).await;
        let errors: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Multiple(errors))
        }
    }

    /// Handle a delayed task delivered by the queue.
    ///
    /// `attempt` is the zero-based delivery attempt; it is recorded on the
    /// invocation a start request creates.
    pub async fn execute_serialized_action(
        &self,
        payload: &[u8],
        attempt: u32,
    ) -> Result<(), EngineError> {
        match ActionPayload::decode(payload)? {
            ActionPayload::Tick { job_id, tick_nonce } => self.timer_tick(&job_id, tick_nonce).await,
            ActionPayload::Start {
                job_id,
                invocation_nonce,
            } => {
                self.start_invocation(&job_id, invocation_nonce, attempt)
                    .await
            }
        }
    }

    /// Create or update a job from its definition.
    ///
    /// Does nothing if the job is enabled and already at this revision.
    pub async fn update_job(&self, def: &JobDefinition) -> Result<(), EngineError> {
        let Some((project, _)) = def.job_id.split() else {
            return Err(EngineError::InvalidJobId(def.job_id.to_string()));
        };

        self.txn(&def.job_id, |txn| {
            let def = def.clone();
            let project = project.clone();
            Box::pin(async move {
                if !txn.is_new() && txn.job().enabled && txn.job().revision == def.revision {
                    return Ok(TxnOutcome::Skip(()));
                }
                if txn.is_new() {
                    let mut fresh = JobRecord::new(def.job_id.clone(), project);
                    fresh.schedule = def.schedule.clone();
                    *txn.job_mut() = fresh;
                }

                let was_enabled = txn.job().enabled;
                let old_schedule = std::mem::replace(&mut txn.job_mut().schedule, def.schedule);
                {
                    let job = txn.job_mut();
                    job.enabled = true;
                    job.revision = def.revision;
                    job.payload = def.payload;
                }

                if !was_enabled {
                    txn.roll(JobEvent::JobEnabled).await?;
                }
                if txn.job().schedule != old_schedule {
                    tracing::info!(
                        job_id = %txn.job().job_id,
                        old = %old_schedule,
                        new = %txn.job().schedule,
                        "Job's schedule changed"
                    );
                    txn.roll(JobEvent::ScheduleChanged).await?;
                }
                Ok(TxnOutcome::Commit(()))
            })
        })
        .await
    }

    /// Disable a job. Pending ticks and starts become no-ops; a running
    /// invocation is left to finish on its own.
    pub async fn disable_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.txn(job_id, |txn| {
            Box::pin(async move {
                if txn.is_new() || !txn.job().enabled {
                    return Ok(TxnOutcome::Skip(()));
                }
                txn.job_mut().enabled = false;
                txn.roll(JobEvent::JobDisabled).await?;
                Ok(TxnOutcome::Commit(()))
            })
        })
        .await
    }

    /// Disable then re-enable a job, dropping everything pending for it.
    pub async fn reset_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.txn(job_id, |txn| {
            Box::pin(async move {
                if txn.is_new() {
                    return Ok(TxnOutcome::Skip(()));
                }
                txn.roll(JobEvent::JobDisabled).await?;
                Ok(TxnOutcome::Commit(()))
            })
        })
        .await?;

        self.txn(job_id, |txn| {
            Box::pin(async move {
                if txn.is_new() || !txn.job().enabled {
                    return Ok(TxnOutcome::Skip(()));
                }
                txn.roll(JobEvent::JobEnabled).await?;
                Ok(TxnOutcome::Commit(()))
            })
        })
        .await
    }

    /// Deliver a timer tick to a job.
    pub async fn timer_tick(&self, job_id: &JobId, tick_nonce: Nonce) -> Result<(), EngineError> {
        self.txn(job_id, |txn| {
            Box::pin(async move {
                if txn.is_new() {
                    tracing::error!(job_id = %txn.job().job_id, "Scheduled job is unexpectedly gone");
                    return Ok(TxnOutcome::Skip(()));
                }
                txn.roll(JobEvent::TimerTick(tick_nonce)).await?;
                Ok(TxnOutcome::Commit(()))
            })
        })
        .await
    }

    /// Handle a start request.
    ///
    /// Delivery is at-least-once, so this handles three cases:
    /// 1. First attempt: create an invocation in STARTING and point the job
    ///    at it.
    /// 2. Redelivery while the previous attempt never left STARTING: assume
    ///    it failed to start, mark it FAILED and start a new one in the same
    ///    transaction.
    /// 3. The job no longer expects this start: do nothing.
    ///
    /// The executor is called outside of any transaction. Launch failures
    /// are recorded on the invocation and returned, so transient ones lead
    /// to redelivery.
    pub async fn start_invocation(
        &self,
        job_id: &JobId,
        invocation_nonce: Nonce,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let started = self
            .txn(job_id, |txn| {
                Box::pin(async move {
                    if txn.is_new() {
                        tracing::error!(job_id = %txn.job().job_id, "Queued job is unexpectedly gone");
                        return Ok(TxnOutcome::Skip(None));
                    }
                    if !txn.job().state.is_expecting_invocation(invocation_nonce) {
                        tracing::warn!(
                            job_id = %txn.job().job_id,
                            nonce = %invocation_nonce,
                            attempt,
                            "No longer need to start invocation"
                        );
                        return Ok(TxnOutcome::Skip(None));
                    }

                    let id = txn.generate_invocation_id().await?;
                    let now = txn.now();
                    let limit = txn.debug_log_limit();
                    let mut invocation =
                        InvocationRecord::starting(id, txn.job(), invocation_nonce, attempt, now);
                    invocation.append_debug_log(now, limit, "Invocation initiated");
                    txn.put_invocation(invocation.clone());

                    if let Some(previous_id) = txn.job().state.invocation_id
                        && let Some(mut previous) = txn.get_invocation(previous_id).await?
                        && !previous.status.is_final()
                    {
                        previous.append_debug_log(
                            now,
                            limit,
                            &format!("New invocation is starting ({}), marking this one as failed.", id),
                        );
                        previous.status = InvocationStatus::Failed;
                        previous.finished_at = Some(now);
                        txn.put_invocation(previous);
                    }

                    txn.roll(JobEvent::InvocationStarting(invocation_nonce, id))
                        .await?;
                    Ok(TxnOutcome::Commit(Some(invocation)))
                })
            })
            .await?;

        let Some(invocation) = started else {
            return Ok(());
        };

        tracing::info!(job_id = %job_id, invocation_id = %invocation.id, attempt, "Launching invocation");
        let payload = invocation.payload.clone();
        let mut ctl = InvocationController::new(self.clone(), invocation);
        let result = match self.inner.executor.launch(&payload, &mut ctl).await {
            Ok(()) if ctl.status() == InvocationStatus::Starting => {
                Err(EngineError::ContractViolation(
                    "executor did not move the invocation out of STARTING".into(),
                ))
            }
            Ok(()) => Ok(()),
            Err(e) => Err(EngineError::Launch(e)),
        };

        if let Err(err) = &result
            && let Err(save_err) = ctl.launch_failed(err).await
        {
            tracing::error!(
                job_id = %job_id,
                invocation_id = %ctl.invocation_id(),
                error = %save_err,
                "Failed to save invocation state"
            );
        }
        result
    }

    /// Tell the engine that an invocation finished.
    ///
    /// For executors that learn about completion out of band. The job is
    /// rescheduled if it still tracks the invocation.
    pub async fn invocation_done(
        &self,
        job_id: &JobId,
        invocation_id: InvocationId,
    ) -> Result<(), EngineError> {
        self.txn(job_id, |txn| {
            Box::pin(async move {
                if txn.is_new() || !txn.job().state.is_tracking(invocation_id) {
                    return Ok(TxnOutcome::Skip(()));
                }
                txn.roll(JobEvent::InvocationDone(invocation_id)).await?;
                Ok(TxnOutcome::Commit(()))
            })
        })
        .await
    }

    /// Get a job record.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<JobRecord>, EngineError> {
        Ok(self.inner.storage.get_job(job_id).await?)
    }

    /// List the most recent invocations of a job, most recent first.
    pub async fn invocations(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<InvocationRecord>, EngineError> {
        Ok(self.inner.storage.list_invocations(job_id, limit).await?)
    }
}
