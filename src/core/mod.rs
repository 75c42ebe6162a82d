//! Pure building blocks: identifiers, schedules, the job state machine, and
//! the injectable clock and entropy sources.

pub mod clock;
pub mod invocation_id;
pub mod schedule;
pub mod state;
pub mod types;
