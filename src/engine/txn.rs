//! Job-scoped transactions.
//!
//! [`Engine::txn`] reads a job record, hands it to a mutator through a
//! [`JobTxn`], and writes it back only if the mutator changed it. The whole
//! cycle is retried when the commit loses a race with a concurrent
//! transaction on the same job. Invocation writes buffered by the mutator
//! commit atomically with the job record.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};

use super::action::ActionPayload;
use super::{Engine, EngineError};
use crate::core::invocation_id;
use crate::core::schedule::Schedule;
use crate::core::state::{self, Action, JobEvent, TransitionInput};
use crate::core::types::{InvocationId, JobId, ProjectId};
use crate::queue::{Channel, DelayedTask};
use crate::storage::{InvocationRecord, JobRecord, Transaction};

/// What the transaction should do with the job record once the mutator
/// returns.
#[derive(Debug)]
pub(crate) enum TxnOutcome<T> {
    /// Write the job record back if it changed.
    Commit(T),
    /// Leave the job record alone. Buffered invocation writes still commit.
    Skip(T),
}

/// Future returned by a transaction mutator.
pub(crate) type MutatorFuture<'t, T> = BoxFuture<'t, Result<TxnOutcome<T>, EngineError>>;

/// A job record under a transaction.
pub(crate) struct JobTxn {
    engine: Engine,
    tx: Box<dyn Transaction>,
    job: JobRecord,
    is_new: bool,
}

impl JobTxn {
    /// The job being mutated.
    ///
    /// For a job that does not exist yet this is a disabled placeholder.
    pub(crate) fn job(&self) -> &JobRecord {
        &self.job
    }

    pub(crate) fn job_mut(&mut self) -> &mut JobRecord {
        &mut self.job
    }

    /// Whether no record existed when the transaction began.
    pub(crate) fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    pub(crate) fn debug_log_limit(&self) -> usize {
        self.engine.inner.config.debug_log_limit
    }

    pub(crate) async fn get_invocation(
        &mut self,
        id: InvocationId,
    ) -> Result<Option<InvocationRecord>, EngineError> {
        Ok(self.tx.get_invocation(id).await?)
    }

    pub(crate) fn put_invocation(&mut self, invocation: InvocationRecord) {
        self.tx.put_invocation(invocation);
    }

    /// Pick an invocation ID not used by this job.
    ///
    /// Probes storage (including writes buffered by this transaction) and
    /// draws fresh randomness on every collision.
    pub(crate) async fn generate_invocation_id(&mut self) -> Result<InvocationId, EngineError> {
        let attempts = self.engine.inner.config.invocation_id_attempts;
        for _ in 0..attempts {
            let id = invocation_id::compose(self.engine.now(), self.engine.inner.entropy.id_suffix());
            if self.tx.get_invocation(id).await?.is_none() {
                return Ok(id);
            }
            tracing::debug!(job_id = %self.job.job_id, invocation_id = %id, "Invocation ID collision");
        }
        Err(EngineError::IdExhausted(attempts))
    }

    /// Feed `event` to the state machine, enqueue the actions it emits and
    /// store the new state on the job.
    ///
    /// Actions are enqueued before the transaction commits. If the commit
    /// then fails, the delivered messages carry nonces the stored state never
    /// learned about and are dropped as stale.
    pub(crate) async fn roll(&mut self, event: JobEvent) -> Result<(), EngineError> {
        let now = self.engine.now();
        let next_fire = if event.needs_schedule() {
            let schedule =
                Schedule::parse(self.job.schedule.as_str()).map_err(|source| {
                    EngineError::BadSchedule {
                        expression: self.job.schedule.clone(),
                        source,
                    }
                })?;
            schedule
                .next_after(now)
                .map_err(|source| EngineError::BadSchedule {
                    expression: self.job.schedule.clone(),
                    source,
                })?
        } else {
            now
        };

        let transition = {
            let input = TransitionInput {
                next_fire,
                nonces: &*self.engine.inner.entropy,
            };
            state::transition(&self.job.state, &event, &input)
        };

        let Some(new_state) = transition.state else {
            tracing::warn!(
                job_id = %self.job.job_id,
                state = %self.job.state.kind,
                event = ?event,
                "Ignoring event"
            );
            return Ok(());
        };

        enqueue_actions(&self.engine, &self.job.job_id, &transition.actions, now).await?;

        if new_state.kind != self.job.state.kind {
            tracing::info!(
                job_id = %self.job.job_id,
                from = %self.job.state.kind,
                to = %new_state.kind,
                event = ?event,
                "Job state changed"
            );
        }
        self.job.state = new_state;
        Ok(())
    }
}

/// Turn actions into delayed tasks, one concurrent enqueue per channel.
async fn enqueue_actions(
    engine: &Engine,
    job_id: &JobId,
    actions: &[Action],
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    if actions.is_empty() {
        return Ok(());
    }
    let start_delay = chrono::Duration::from_std(engine.inner.config.start_delay)
        .unwrap_or_else(|_| chrono::Duration::zero());

    let mut timers = Vec::new();
    let mut invocations = Vec::new();
    for action in actions {
        match *action {
            Action::TickLater { nonce, when } => timers.push(DelayedTask {
                channel: Channel::Timers,
                eta: when,
                payload: ActionPayload::Tick {
                    job_id: job_id.clone(),
                    tick_nonce: nonce,
                }
                .encode()?,
            }),
            Action::StartInvocation { nonce } => invocations.push(DelayedTask {
                channel: Channel::Invocations,
                eta: now + start_delay,
                payload: ActionPayload::Start {
                    job_id: job_id.clone(),
                    invocation_nonce: nonce,
                }
                .encode()?,
            }),
        }
    }

    let queue = &engine.inner.queue;
    let batches = [timers, invocations]
        .into_iter()
        .filter(|batch| !batch.is_empty())
        .map(|batch| queue.enqueue(batch));
    for result in join_all(batches).await {
        result?;
    }
    Ok(())
}

impl Engine {
    /// Run `mutator` against the job record of `job_id` in a transaction.
    ///
    /// The mutator may be called several times: once per attempt. Errors it
    /// returns abort the transaction and are returned as is. Commit failures
    /// other than contention, and contention on the last attempt, surface as
    /// [`EngineError::Storage`].
    pub(crate) async fn txn<T, F>(&self, job_id: &JobId, mut mutator: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut JobTxn) -> MutatorFuture<'t, T> + Send,
    {
        let attempts = self.inner.config.transaction_attempts.max(1);
        let mut attempt = 1;

        loop {
            let tx = self.inner.storage.begin(job_id).await?;
            let (job, is_new) = match tx.job() {
                Some(job) => (job.clone(), false),
                None => {
                    let project = job_id.project().unwrap_or_else(|| ProjectId::new(""));
                    (JobRecord::new(job_id.clone(), project), true)
                }
            };
            let original = job.clone();

            let mut scoped = JobTxn {
                engine: self.clone(),
                tx,
                job,
                is_new,
            };
            let outcome = mutator(&mut scoped).await?;
            let JobTxn { mut tx, job, .. } = scoped;

            let value = match outcome {
                TxnOutcome::Commit(value) => {
                    if is_new || job != original {
                        tx.put_job(job);
                    }
                    value
                }
                TxnOutcome::Skip(value) => value,
            };

            match tx.commit().await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(job_id = %job_id, attempt, "Committed on attempt");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_contention() && attempt < attempts => {
                    tracing::warn!(job_id = %job_id, attempt, error = %e, "Retrying transaction");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
