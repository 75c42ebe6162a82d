//! Testing utilities for users of the cronkeeper library.
//!
//! This module provides deterministic stand-ins for the engine's injected
//! collaborators:
//!
//! - [`ManualClock`]: A clock that only moves when told to
//! - [`ScriptedEntropy`]: Sequential nonces and controllable ID randomness
//! - [`ScriptedExecutor`]: An executor following a script of behaviors
//! - [`TestHarness`]: An engine wired to in-memory storage and a recording queue

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::core::clock::{Clock, Entropy};
use crate::core::state::NonceSource;
use crate::core::types::{InvocationId, JobId, Nonce};
use crate::engine::{ActionPayload, Engine, EngineError, InvocationController, JobDefinition};
use crate::executor::{Executor, LaunchError};
use crate::queue::{Channel, DelayedTask, InMemoryQueue};
use crate::storage::{InMemoryStorage, InvocationStatus, JobRecord};

/// A clock that only moves when told to.
///
/// Cloning yields another handle to the same time.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock stopped at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = now;
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Deterministic entropy.
///
/// Nonces count up from 1. Invocation ID suffixes come from a script, then
/// from a counter, unless a fixed suffix is set, in which case every draw
/// returns it (useful to force ID collisions).
#[derive(Default)]
pub struct ScriptedEntropy {
    next_nonce: AtomicI64,
    suffixes: Mutex<SuffixScript>,
}

#[derive(Default)]
struct SuffixScript {
    scripted: VecDeque<u16>,
    fixed: Option<u16>,
    counter: u16,
}

impl ScriptedEntropy {
    /// Create entropy with a counting suffix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue suffixes to return before falling back to the counter.
    pub fn push_suffixes(&self, suffixes: impl IntoIterator<Item = u16>) {
        let mut script = self.suffixes.lock().expect("entropy lock poisoned");
        script.scripted.extend(suffixes);
    }

    /// Return `suffix` on every draw from now on (`None` to stop).
    pub fn set_fixed_suffix(&self, suffix: Option<u16>) {
        self.suffixes.lock().expect("entropy lock poisoned").fixed = suffix;
    }

    /// Number of nonces handed out so far.
    pub fn nonces_issued(&self) -> i64 {
        self.next_nonce.load(Ordering::SeqCst)
    }
}

impl NonceSource for ScriptedEntropy {
    fn next_nonce(&self) -> Nonce {
        Nonce::new(self.next_nonce.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Entropy for ScriptedEntropy {
    fn id_suffix(&self) -> u16 {
        let mut script = self.suffixes.lock().expect("entropy lock poisoned");
        if let Some(fixed) = script.fixed {
            return fixed;
        }
        if let Some(next) = script.scripted.pop_front() {
            return next;
        }
        script.counter = script.counter.wrapping_add(1);
        script.counter
    }
}

/// What a [`ScriptedExecutor`] does on launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// Finish synchronously with SUCCEEDED.
    Succeed,
    /// Finish synchronously with FAILED.
    Fail,
    /// Save RUNNING and return, leaving the invocation running.
    Run,
    /// Return a transient error without touching the invocation.
    TransientError,
    /// Return a fatal error without touching the invocation.
    FatalError,
    /// Return success without touching the invocation.
    LeaveStarting,
    /// Never return, like a process that died mid-launch.
    Hang,
    /// Wait for [`ScriptedExecutor::release`], then save RUNNING and
    /// SUCCEEDED.
    Stall,
}

/// An executor that follows a script of [`LaunchBehavior`]s.
///
/// Scripted behaviors are used in order; once the script runs out every
/// launch uses the default behavior.
pub struct ScriptedExecutor {
    default: LaunchBehavior,
    script: Mutex<VecDeque<LaunchBehavior>>,
    launches: Mutex<Vec<(JobId, InvocationId)>>,
    released: Notify,
}

impl ScriptedExecutor {
    /// Create an executor whose every launch uses `default`.
    pub fn new(default: LaunchBehavior) -> Self {
        Self {
            default,
            script: Mutex::new(VecDeque::new()),
            launches: Mutex::new(Vec::new()),
            released: Notify::new(),
        }
    }

    /// Use `behavior` for the next unscripted launch.
    pub fn push(&self, behavior: LaunchBehavior) {
        self.script
            .lock()
            .expect("executor lock poisoned")
            .push_back(behavior);
    }

    /// Let one stalled launch carry on.
    pub fn release(&self) {
        self.released.notify_one();
    }

    /// Invocations launched so far, in order.
    pub fn launches(&self) -> Vec<(JobId, InvocationId)> {
        self.launches.lock().expect("executor lock poisoned").clone()
    }

    /// Number of launches so far.
    pub fn launch_count(&self) -> usize {
        self.launches.lock().expect("executor lock poisoned").len()
    }

    fn next_behavior(&self) -> LaunchBehavior {
        self.script
            .lock()
            .expect("executor lock poisoned")
            .pop_front()
            .unwrap_or(self.default)
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new(LaunchBehavior::Succeed)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn launch(
        &self,
        _payload: &[u8],
        ctl: &mut InvocationController,
    ) -> Result<(), LaunchError> {
        self.launches
            .lock()
            .expect("executor lock poisoned")
            .push((ctl.job_id().clone(), ctl.invocation_id()));

        match self.next_behavior() {
            LaunchBehavior::Succeed => {
                ctl.debug_log("scripted success");
                ctl.save(InvocationStatus::Succeeded).await?;
                Ok(())
            }
            LaunchBehavior::Fail => {
                ctl.debug_log("scripted failure");
                ctl.save(InvocationStatus::Failed).await?;
                Ok(())
            }
            LaunchBehavior::Run => {
                ctl.save(InvocationStatus::Running).await?;
                Ok(())
            }
            LaunchBehavior::TransientError => {
                Err(LaunchError::Transient("scripted transient error".into()))
            }
            LaunchBehavior::FatalError => Err(LaunchError::Fatal("scripted fatal error".into())),
            LaunchBehavior::LeaveStarting => Ok(()),
            LaunchBehavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
            LaunchBehavior::Stall => {
                self.released.notified().await;
                ctl.save(InvocationStatus::Running).await?;
                ctl.debug_log("scripted success");
                ctl.save(InvocationStatus::Succeeded).await?;
                Ok(())
            }
        }
    }
}

/// An engine wired to in-memory collaborators.
///
/// # Example
///
/// ```
/// use cronkeeper::testing::TestHarness;
///
/// # #[tokio::main]
/// # async fn main() {
/// let harness = TestHarness::new();
/// let def = TestHarness::definition("p/j1", "* * * * *");
///
/// harness.engine.update_job(&def).await.unwrap();
/// assert_eq!(harness.queue.len(), 1);
/// # }
/// ```
pub struct TestHarness {
    /// The engine under test.
    pub engine: Engine,
    /// Storage behind the engine.
    pub storage: InMemoryStorage,
    /// Queue recording the engine's delayed tasks.
    pub queue: InMemoryQueue,
    /// Clock driving the engine.
    pub clock: ManualClock,
    /// Entropy driving the engine.
    pub entropy: Arc<ScriptedEntropy>,
    /// Executor behind the engine.
    pub executor: Arc<ScriptedExecutor>,
}

impl TestHarness {
    /// Start time of every harness: 2024-01-15T12:00:30Z.
    pub fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 30)
            .single()
            .expect("valid start time")
    }

    /// Create a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a harness with the given configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let clock = ManualClock::new(Self::start_time());
        let entropy = Arc::new(ScriptedEntropy::new());
        let executor = Arc::new(ScriptedExecutor::default());

        let engine = Engine::builder(
            Arc::new(storage.clone()),
            Arc::new(queue.clone()),
            executor.clone(),
        )
        .clock(Arc::new(clock.clone()))
        .entropy(entropy.clone())
        .config(config)
        .build();

        Self {
            engine,
            storage,
            queue,
            clock,
            entropy,
            executor,
        }
    }

    /// A definition with revision `rev1` and an empty JSON payload.
    pub fn definition(job_id: &str, schedule: &str) -> JobDefinition {
        JobDefinition {
            job_id: JobId::new(job_id),
            revision: "rev1".into(),
            schedule: schedule.into(),
            payload: b"{}".to_vec(),
        }
    }

    /// Read a job that must exist.
    pub async fn job(&self, job_id: &str) -> JobRecord {
        self.engine
            .job(&JobId::new(job_id))
            .await
            .expect("storage error")
            .expect("job should exist")
    }

    /// Decode the actions currently in the queue.
    pub fn pending_actions(&self) -> Vec<ActionPayload> {
        self.queue
            .tasks()
            .iter()
            .map(|t| ActionPayload::decode(&t.payload).expect("valid action payload"))
            .collect()
    }

    /// Remove the queued tasks of one channel, leaving the others queued.
    pub fn take(&self, channel: Channel) -> Vec<DelayedTask> {
        let (taken, kept): (Vec<_>, Vec<_>) = self
            .queue
            .drain()
            .into_iter()
            .partition(|t| t.channel == channel);
        self.queue.push(kept);
        taken
    }

    /// Deliver a task as the queue would, on the given attempt.
    pub async fn deliver(&self, task: &DelayedTask, attempt: u32) -> Result<(), EngineError> {
        self.engine
            .execute_serialized_action(&task.payload, attempt)
            .await
    }

    /// Deliver every task currently queued on `channel` once.
    pub async fn deliver_channel(&self, channel: Channel) -> Vec<Result<(), EngineError>> {
        let mut results = Vec::new();
        for task in self.take(channel) {
            results.push(self.deliver(&task, 0).await);
        }
        results
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
