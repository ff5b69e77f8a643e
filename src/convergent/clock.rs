//! Version vectors
//!
//! A ClockVector records, for every actor a replica has heard from, the
//! highest change sequence number it holds. Because each actor's log is
//! gapless, that single number summarizes everything the replica knows
//! about the actor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a replica
pub type ActorId = String;

/// Sequence number within an actor's change log (1-based)
pub type Seq = u64;

/// Mapping from actor to the highest sequence number known for it.
///
/// Entries only ever move forward: [`ClockVector::observe`] ignores
/// sequence numbers below the current one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockVector {
    seen: BTreeMap<ActorId, Seq>,
}

impl ClockVector {
    /// Create an empty clock (knows nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that has seen up to seq from actor
    pub fn at(actor: impl Into<ActorId>, seq: Seq) -> Self {
        let mut clock = Self::new();
        clock.observe(&actor.into(), seq);
        clock
    }

    /// Highest sequence number seen from an actor (0 if never seen)
    pub fn get(&self, actor: &str) -> Seq {
        self.seen.get(actor).copied().unwrap_or(0)
    }

    /// Record having seen a change from an actor
    pub fn observe(&mut self, actor: &ActorId, seq: Seq) {
        if seq == 0 {
            return;
        }
        let current = self.seen.entry(actor.clone()).or_insert(0);
        if seq > *current {
            *current = seq;
        }
    }

    /// Merge another clock into this one (take max of each actor)
    pub fn merge(&mut self, other: &ClockVector) {
        for (actor, seq) in &other.seen {
            self.observe(actor, *seq);
        }
    }

    /// Check if this clock covers a specific change
    pub fn has_seen(&self, actor: &str, seq: Seq) -> bool {
        self.get(actor) >= seq
    }

    /// Check if this clock has seen everything `other` has seen
    pub fn dominates(&self, other: &ClockVector) -> bool {
        other.seen.iter().all(|(a, s)| self.get(a) >= *s)
    }

    /// Neither clock dominates the other
    pub fn is_concurrent_with(&self, other: &ClockVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Entries of `self` that are ahead of `other`, as `(actor, other's seq, our seq)`.
    pub fn ahead_of<'a>(
        &'a self,
        other: &'a ClockVector,
    ) -> impl Iterator<Item = (&'a ActorId, Seq, Seq)> + 'a {
        self.seen
            .iter()
            .filter(move |(a, s)| other.get(a) < **s)
            .map(move |(a, s)| (a, other.get(a), *s))
    }

    /// Total number of changes covered by this clock
    pub fn total(&self) -> u64 {
        self.seen.values().sum()
    }

    /// Get all actors this clock knows about
    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.seen.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, Seq)> {
        self.seen.iter().map(|(a, s)| (a, *s))
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Copy of this clock without the given actor's entry
    pub fn without(&self, actor: &str) -> ClockVector {
        let mut seen = self.seen.clone();
        seen.remove(actor);
        ClockVector { seen }
    }
}

impl FromIterator<(ActorId, Seq)> for ClockVector {
    fn from_iter<I: IntoIterator<Item = (ActorId, Seq)>>(iter: I) -> Self {
        let mut clock = ClockVector::new();
        for (actor, seq) in iter {
            clock.observe(&actor, seq);
        }
        clock
    }
}
