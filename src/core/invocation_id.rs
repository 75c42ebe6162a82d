//! Time-derived invocation identifiers.
//!
//! Layout of the 64-bit value, most significant bit first:
//!
//! ```text
//! [1 bit: 0][43 bits: !millis since 2015-01-01][16 bits: random][4 bits: tag = 0]
//! ```
//!
//! The millisecond counter is negated, so identifiers shrink as time moves
//! forward and an ascending numeric scan returns the most recent invocation
//! first. The random field separates invocations created in the same
//! millisecond; collisions are resolved by the caller probing storage.

use chrono::{DateTime, Utc};

use crate::core::types::InvocationId;

/// 2015-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MILLIS: i64 = 1_420_070_400_000;

const TIMESTAMP_BITS: u32 = 43;
const TIMESTAMP_MASK: i64 = (1 << TIMESTAMP_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = 20;
const RANDOM_SHIFT: u32 = 4;

/// Format tag stored in the low 4 bits.
pub const FORMAT_TAG: i64 = 0;

/// Build an identifier from a creation time and a random suffix.
pub fn compose(created: DateTime<Utc>, random: u16) -> InvocationId {
    let millis = created.timestamp_millis() - EPOCH_MILLIS;
    let negated = !millis & TIMESTAMP_MASK;
    InvocationId::new((negated << TIMESTAMP_SHIFT) | (i64::from(random) << RANDOM_SHIFT) | FORMAT_TAG)
}

/// Recover the creation time encoded in an identifier (millisecond precision).
pub fn created_at(id: InvocationId) -> Option<DateTime<Utc>> {
    let negated = (id.get() >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK;
    let millis = !negated & TIMESTAMP_MASK;
    DateTime::from_timestamp_millis(millis + EPOCH_MILLIS)
}

/// Recover the random suffix of an identifier.
pub fn random_part(id: InvocationId) -> u16 {
    ((id.get() >> RANDOM_SHIFT) & 0xFFFF) as u16
}
