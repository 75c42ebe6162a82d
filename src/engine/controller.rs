//! Invocation controller handed to executors.

use super::txn::TxnOutcome;
use super::{Engine, EngineError};
use crate::core::state::JobEvent;
use crate::core::types::{InvocationId, JobId};
use crate::storage::{InvocationRecord, InvocationStatus};

/// Mediates between an executor and the records of one invocation.
///
/// The executor mutates the invocation through [`debug_log`] and persists it
/// with [`save`]. Status changes that matter to the job (leaving STARTING,
/// reaching a terminal status) are fed to the job's state machine in the
/// same transaction that stores the invocation.
///
/// [`debug_log`]: InvocationController::debug_log
/// [`save`]: InvocationController::save
pub struct InvocationController {
    engine: Engine,
    /// The record as last persisted.
    saved: InvocationRecord,
    /// The record with pending, unsaved changes.
    current: InvocationRecord,
}

impl InvocationController {
    pub(crate) fn new(engine: Engine, invocation: InvocationRecord) -> Self {
        Self {
            engine,
            saved: invocation.clone(),
            current: invocation,
        }
    }

    /// The job this invocation belongs to.
    pub fn job_id(&self) -> &JobId {
        &self.current.job_id
    }

    /// The invocation being controlled.
    pub fn invocation_id(&self) -> InvocationId {
        self.current.id
    }

    /// Status as last persisted.
    pub fn status(&self) -> InvocationStatus {
        self.saved.status
    }

    /// Append a line to the invocation's debug log and to the process log.
    ///
    /// The line is persisted with the next [`save`](Self::save).
    pub fn debug_log(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(
            job_id = %self.current.job_id,
            invocation_id = %self.current.id,
            "{}",
            message
        );
        let now = self.engine.now();
        let limit = self.engine.inner.config.debug_log_limit;
        self.current.append_debug_log(now, limit, message);
    }

    /// Persist pending changes with the given status.
    pub async fn save(&mut self, status: InvocationStatus) -> Result<(), EngineError> {
        self.save_impl(status, true).await
    }

    /// Record a launch failure.
    ///
    /// The job is left alone while the invocation never left STARTING and
    /// the failure is transient: the start request is redelivered and must
    /// still find the job expecting it.
    pub(crate) async fn launch_failed(&mut self, err: &EngineError) -> Result<(), EngineError> {
        self.debug_log(format!("Failed to run the task: {}", err));
        let update_job = self.saved.status != InvocationStatus::Starting || !err.is_transient();
        self.save_impl(InvocationStatus::Failed, update_job).await
    }

    async fn save_impl(
        &mut self,
        status: InvocationStatus,
        update_job: bool,
    ) -> Result<(), EngineError> {
        let mut saving = self.current.clone();
        saving.status = status;
        if saving == self.saved {
            return Ok(());
        }
        if self.saved.status.is_final() {
            return Err(EngineError::InvocationFinished(self.saved.id));
        }

        let has_started = self.saved.status == InvocationStatus::Starting
            && status != InvocationStatus::Starting;
        let has_finished = status.is_final();
        if has_finished {
            let now = self.engine.now();
            saving.finished_at = Some(now);
            let took = (now - saving.started_at).to_std().unwrap_or_default();
            let limit = self.engine.inner.config.debug_log_limit;
            saving.append_debug_log(
                now,
                limit,
                &format!("Invocation finished in {:?} with status {}", took, status),
            );
        }

        let drive_job = update_job && self.saved.status != status;
        let id = saving.id;
        self.engine
            .txn(&saving.job_id, |txn| {
                let saving = saving.clone();
                Box::pin(async move {
                    // Redelivery may have failed this attempt behind our back.
                    if let Some(stored) = txn.get_invocation(id).await?
                        && stored.status.is_final()
                    {
                        return Err(EngineError::InvocationFinished(id));
                    }
                    // The invocation is stored even if the job moved on.
                    txn.put_invocation(saving);
                    if !drive_job {
                        return Ok(TxnOutcome::Skip(()));
                    }
                    if txn.is_new() {
                        tracing::error!(job_id = %txn.job().job_id, invocation_id = %id, "Active job is unexpectedly gone");
                        return Ok(TxnOutcome::Skip(()));
                    }
                    if !txn.job().state.is_tracking(id) {
                        tracing::warn!(
                            job_id = %txn.job().job_id,
                            invocation_id = %id,
                            current = ?txn.job().state.invocation_id,
                            "The invocation is no longer current"
                        );
                        return Ok(TxnOutcome::Skip(()));
                    }
                    if has_started {
                        txn.roll(JobEvent::InvocationStarted(id)).await?;
                    }
                    if has_finished {
                        txn.roll(JobEvent::InvocationDone(id)).await?;
                    }
                    Ok(TxnOutcome::Commit(()))
                })
            })
            .await?;

        self.current = saving.clone();
        self.saved = saving;
        Ok(())
    }
}
