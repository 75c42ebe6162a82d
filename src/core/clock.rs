//! Injectable time and randomness.
//!
//! The engine never reads the wall clock or a global RNG directly; both are
//! constructor-injected so transitions and identifiers are reproducible in
//! tests.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::core::state::NonceSource;
use crate::core::types::Nonce;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of randomness for nonces and invocation identifiers.
pub trait Entropy: NonceSource + Send + Sync {
    /// Random bits for the invocation identifier suffix.
    fn id_suffix(&self) -> u16;
}

/// Entropy backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadEntropy;

impl NonceSource for ThreadEntropy {
    fn next_nonce(&self) -> Nonce {
        Nonce::new(rand::rng().random_range(1..=i64::MAX))
    }
}

impl Entropy for ThreadEntropy {
    fn id_suffix(&self) -> u16 {
        rand::rng().random()
    }
}
