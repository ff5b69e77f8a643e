//! Append-only, causally ordered change log

use super::change::Change;
use super::clock::{ActorId, ClockVector, Seq};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("change {actor}:{seq} depends on missing change {missing_actor}:{missing_seq}")]
    CausalityViolation {
        actor: ActorId,
        seq: Seq,
        missing_actor: ActorId,
        missing_seq: Seq,
    },

    #[error("change {actor}:{seq} is already in the log")]
    Duplicate { actor: ActorId, seq: Seq },
}

/// Every change a document has accepted, keyed by `(actor, seq)`.
///
/// A change is only accepted once all of its dependencies are present, so
/// the log is always causally closed and its clock summarizes it exactly.
#[derive(Clone, Debug, Default)]
pub struct ChangeLog {
    changes: BTreeMap<(ActorId, Seq), Change>,
    clock: ClockVector,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock covering exactly the changes in the log
    pub fn clock(&self) -> &ClockVector {
        &self.clock
    }

    /// Next sequence number for `actor`'s own changes
    pub fn next_seq(&self, actor: &str) -> Seq {
        self.clock.get(actor) + 1
    }

    pub fn contains(&self, actor: &str, seq: Seq) -> bool {
        self.clock.has_seen(actor, seq)
    }

    pub fn get(&self, actor: &str, seq: Seq) -> Option<&Change> {
        self.changes.get(&(actor.to_string(), seq))
    }

    /// Append a change whose dependencies are all present.
    pub fn append(&mut self, change: Change) -> Result<(), DeliveryError> {
        if self.contains(&change.actor, change.seq) {
            return Err(DeliveryError::Duplicate {
                actor: change.actor,
                seq: change.seq,
            });
        }
        if let Some((missing_actor, missing_seq)) = change.missing_dependency(&self.clock) {
            return Err(DeliveryError::CausalityViolation {
                actor: change.actor,
                seq: change.seq,
                missing_actor,
                missing_seq,
            });
        }
        self.clock.observe(&change.actor, change.seq);
        self.changes.insert(change.key(), change);
        Ok(())
    }

    /// All changes not covered by `clock`, dependencies first.
    ///
    /// Sorted by `(depth, actor, seq)`: a dependency always has a smaller
    /// depth than its dependents, and causally unrelated changes at the
    /// same depth are ordered by actor id.
    pub fn changes_since(&self, clock: &ClockVector) -> Vec<Change> {
        let mut missing: Vec<&Change> = self
            .changes
            .iter()
            .filter(|((actor, seq), _)| !clock.has_seen(actor, *seq))
            .map(|(_, change)| change)
            .collect();
        missing.sort_by(|a, b| {
            (a.depth(), &a.actor, a.seq).cmp(&(b.depth(), &b.actor, b.seq))
        });
        missing.into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
