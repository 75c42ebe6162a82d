//! Per-job state machine.
//!
//! [`transition`] is a pure function: given the persisted [`JobState`], an
//! incoming [`JobEvent`] and the transition inputs (the next fire time and a
//! nonce source), it returns the new state plus the [`Action`]s that
//! the engine must turn into delayed deliveries. It performs no I/O.
//!
//! Every emitted action carries a fresh [`Nonce`]. The event that later
//! answers the action must present the same nonce, so duplicated, reordered
//! or superseded deliveries degrade into no-ops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::types::{InvocationId, Nonce};

/// Top-level state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    /// Job is not scheduled. Initial rest state.
    #[default]
    Disabled,
    /// A tick is pending for the next fire time.
    Scheduled,
    /// The tick fired; a start request is in flight.
    Queued,
    /// An invocation record exists and is being launched.
    Starting,
    /// The executor reported the invocation as running.
    Running,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Disabled => "DISABLED",
            StateKind::Scheduled => "SCHEDULED",
            StateKind::Queued => "QUEUED",
            StateKind::Starting => "STARTING",
            StateKind::Running => "RUNNING",
        };
        f.write_str(name)
    }
}

/// Persisted state machine state of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    /// Current state.
    pub kind: StateKind,
    /// Nonce of the pending tick (SCHEDULED only).
    pub tick_nonce: Option<Nonce>,
    /// When the pending tick is due (SCHEDULED only).
    pub tick_time: Option<DateTime<Utc>>,
    /// Nonce of the pending start request (QUEUED and STARTING).
    pub invocation_nonce: Option<Nonce>,
    /// The invocation the job is currently tracking (STARTING and RUNNING).
    pub invocation_id: Option<InvocationId>,
}

impl JobState {
    /// Whether a start request carrying `nonce` should still be acted on.
    ///
    /// True while QUEUED (first attempt) and while STARTING (the previous
    /// attempt never confirmed it started).
    pub fn is_expecting_invocation(&self, nonce: Nonce) -> bool {
        matches!(self.kind, StateKind::Queued | StateKind::Starting)
            && self.invocation_nonce == Some(nonce)
    }

    /// Whether the job currently tracks this invocation.
    pub fn is_tracking(&self, id: InvocationId) -> bool {
        matches!(self.kind, StateKind::Starting | StateKind::Running)
            && self.invocation_id == Some(id)
    }

    fn scheduled(nonce: Nonce, when: DateTime<Utc>) -> Self {
        Self {
            kind: StateKind::Scheduled,
            tick_nonce: Some(nonce),
            tick_time: Some(when),
            invocation_nonce: None,
            invocation_id: None,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job was added or re-enabled in the config.
    JobEnabled,
    /// The job was removed from the config.
    JobDisabled,
    /// The schedule text changed.
    ScheduleChanged,
    /// A delayed tick arrived.
    TimerTick(Nonce),
    /// The engine durably created an invocation record for a start request.
    InvocationStarting(Nonce, InvocationId),
    /// The executor moved the invocation out of STARTING.
    InvocationStarted(InvocationId),
    /// The invocation reached a terminal status.
    InvocationDone(InvocationId),
}

impl JobEvent {
    /// Whether handling this event may need the next fire time.
    ///
    /// The engine only evaluates the schedule for these events, so a broken
    /// schedule never blocks disabling a job or recording invocation progress.
    pub fn needs_schedule(&self) -> bool {
        matches!(
            self,
            JobEvent::JobEnabled
                | JobEvent::ScheduleChanged
                | JobEvent::TimerTick(_)
                | JobEvent::InvocationDone(_)
        )
    }
}

/// Follow-up work emitted by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Deliver `TimerTick(nonce)` at `when`.
    TickLater { nonce: Nonce, when: DateTime<Utc> },
    /// Deliver a start request for `nonce` shortly.
    StartInvocation { nonce: Nonce },
}

/// Source of fresh nonces.
pub trait NonceSource {
    /// Produce a fresh positive nonce.
    fn next_nonce(&self) -> Nonce;
}

/// Everything a transition needs besides the state and the event.
pub struct TransitionInput<'a> {
    /// Next scheduled fire time after the current time.
    pub next_fire: DateTime<Utc>,
    /// Nonce generator.
    pub nonces: &'a dyn NonceSource,
}

/// Result of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The new state, `None` when the event was ignored.
    pub state: Option<JobState>,
    /// Actions to enqueue.
    pub actions: Vec<Action>,
}

impl Transition {
    fn ignore() -> Self {
        Self {
            state: None,
            actions: Vec::new(),
        }
    }

    fn to(state: JobState) -> Self {
        Self {
            state: Some(state),
            actions: Vec::new(),
        }
    }

    fn with(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Whether the event was ignored.
    pub fn is_noop(&self) -> bool {
        self.state.is_none() && self.actions.is_empty()
    }
}

/// Apply `event` to `state`.
pub fn transition(state: &JobState, event: &JobEvent, input: &TransitionInput<'_>) -> Transition {
    use StateKind::*;

    match (state.kind, event) {
        (Disabled, JobEvent::JobEnabled) => arm_tick(input),
        (_, JobEvent::JobEnabled) => Transition::ignore(),

        (Disabled, JobEvent::JobDisabled) => Transition::ignore(),
        (_, JobEvent::JobDisabled) => Transition::to(JobState::default()),

        // Only a pending tick depends on the schedule; other states pick the
        // new schedule up when the current invocation is done.
        (Scheduled, JobEvent::ScheduleChanged) => arm_tick(input),
        (_, JobEvent::ScheduleChanged) => Transition::ignore(),

        (Scheduled, JobEvent::TimerTick(nonce)) if state.tick_nonce == Some(*nonce) => {
            let invocation_nonce = input.nonces.next_nonce();
            Transition::to(JobState {
                kind: Queued,
                invocation_nonce: Some(invocation_nonce),
                ..JobState::default()
            })
            .with(Action::StartInvocation {
                nonce: invocation_nonce,
            })
        }
        (_, JobEvent::TimerTick(_)) => Transition::ignore(),

        (Queued | Starting, JobEvent::InvocationStarting(nonce, id))
            if state.invocation_nonce == Some(*nonce) =>
        {
            Transition::to(JobState {
                kind: Starting,
                invocation_nonce: Some(*nonce),
                invocation_id: Some(*id),
                ..JobState::default()
            })
        }
        (_, JobEvent::InvocationStarting(..)) => Transition::ignore(),

        (Starting, JobEvent::InvocationStarted(id)) if state.invocation_id == Some(*id) => {
            Transition::to(JobState {
                kind: Running,
                invocation_id: Some(*id),
                ..JobState::default()
            })
        }
        (_, JobEvent::InvocationStarted(_)) => Transition::ignore(),

        (Starting | Running, JobEvent::InvocationDone(id)) if state.invocation_id == Some(*id) => {
            arm_tick(input)
        }
        (_, JobEvent::InvocationDone(_)) => Transition::ignore(),
    }
}

fn arm_tick(input: &TransitionInput<'_>) -> Transition {
    let nonce = input.nonces.next_nonce();
    Transition::to(JobState::scheduled(nonce, input.next_fire)).with(Action::TickLater {
        nonce,
        when: input.next_fire,
    })
}
