//! Domain types for the grant-review evaluation core
//!
//! Strongly-typed newtypes prevent primitive obsession (a raw `u64` grant id next
//! to a raw `u64` retry count) and push validation to construction time.

use nutype::nutype;
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a grant, scoped to this process.
///
/// Backed by a monotonic counter rather than a wall-clock timestamp, so
/// concurrent submissions never collide.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct GrantId(u64);

static GRANT_ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

impl GrantId {
    /// Allocates the next grant id in process-wide monotonic order.
    #[must_use]
    pub fn next() -> Self {
        Self::new(GRANT_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique identifier for a single evaluation record.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct EvaluationId(Uuid);

impl EvaluationId {
    /// Generates a fresh evaluation id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a queued or routed message.
///
/// Built from a millisecond timestamp plus a random suffix: strictly
/// increasing in time, with the suffix only needed to disambiguate ids
/// minted within the same millisecond.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct MessageId(String);

impl MessageId {
    /// Mints a new message id from the current wall clock.
    #[must_use]
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let suffix: u32 = rand_suffix();
        Self::try_new(format!("msg-{millis:x}-{suffix:06x}"))
            .expect("generated message id is always within length bounds")
    }
}

/// Cheap non-cryptographic suffix generator so `MessageId` does not need a
/// `rand` dependency the rest of the crate has no other use for.
fn rand_suffix() -> u32 {
    use std::hash::{BuildHasher, Hash, Hasher};
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    Uuid::new_v4().hash(&mut hasher);
    (hasher.finish() & 0xFFFF_FF) as u32
}

/// Identifier an agent instance registers itself with.
///
/// Caller-supplied, unique across active registrations.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentInstanceId(String);

/// An evaluation score, rational in `[0, 100]`.
#[nutype(
    validate(predicate = |v| *v >= Decimal::from(0) && *v <= Decimal::from(100)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct Score(Decimal);

impl Score {
    /// Constructs a score from an `f64`, the shape evaluators send over the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` falls outside `[0, 100]` or is not finite.
    pub fn from_f64(value: f64) -> Result<Self, ScoreError> {
        let decimal = Decimal::from_f64(value).ok_or(ScoreError::PredicateViolated)?;
        Self::try_new(decimal)
    }

    /// Returns the score as an `f64` for averaging and display.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner().to_f64().unwrap_or(0.0)
    }
}

/// Confidence an evaluator attaches to its own score, rational in `[0, 1]`.
#[nutype(
    validate(predicate = |v| *v >= Decimal::from(0) && *v <= Decimal::from(1)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct Confidence(Decimal);

impl Confidence {
    /// Constructs a confidence value from an `f64`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` falls outside `[0, 1]` or is not finite.
    pub fn from_f64(value: f64) -> Result<Self, ConfidenceError> {
        let decimal = Decimal::from_f64(value).ok_or(ConfidenceError::PredicateViolated)?;
        Self::try_new(decimal)
    }
}

/// A monetary grant amount. Never negative.
#[nutype(
    validate(predicate = |v| *v >= Decimal::from(0)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct GrantAmount(Decimal);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_ids_are_monotonic_and_unique() {
        let a = GrantId::next();
        let b = GrantId::next();
        assert!(b.into_inner() > a.into_inner());
    }

    #[test]
    fn message_ids_are_distinct() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn score_rejects_out_of_range() {
        assert!(Score::from_f64(150.0).is_err());
        assert!(Score::from_f64(-1.0).is_err());
        assert!(Score::from_f64(50.0).is_ok());
    }

    #[test]
    fn confidence_rejects_out_of_range() {
        assert!(Confidence::from_f64(1.5).is_err());
        assert!(Confidence::from_f64(0.8).is_ok());
    }
}
