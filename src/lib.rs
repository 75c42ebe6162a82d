//! cronkeeper - A crash-safe engine for declaratively defined recurring jobs.
//!
//! Every job is an independent state machine persisted in its own record.
//! The engine drives those state machines inside job-scoped transactions and
//! turns the actions they emit into delayed tasks on a queue. Nonces attached
//! to every action make duplicated, late or reordered deliveries harmless.
//!
//! Storage, queue, executor, clock and randomness are injected trait objects;
//! the crate ships in-memory and in-process implementations of each.

pub mod config;
pub mod core;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, EngineConfig, Environment, load_definitions_from_directory};
pub use core::clock::{Clock, Entropy, SystemClock, ThreadEntropy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::state::{Action, JobEvent, JobState, StateKind};
pub use core::types::{InvocationId, JobId, Nonce, ProjectId};
pub use engine::{
    ActionPayload, Engine, EngineBuilder, EngineError, InvocationController, JobDefinition,
};
pub use executor::{CommandExecutor, CommandPayload, Executor, LaunchError};
pub use queue::{Channel, DelayedTask, InMemoryQueue, LocalDispatcher, LocalQueue, QueueError, TaskQueue};
pub use storage::{
    InMemoryStorage, InvocationRecord, InvocationStatus, JobRecord, Storage, StorageError,
    Transaction,
};
