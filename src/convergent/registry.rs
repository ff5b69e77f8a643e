//! DocumentRegistry: owns every document a replica holds
//!
//! All document mutation goes through here: local edits via
//! [`DocumentRegistry::propose`], remote changes via
//! [`DocumentRegistry::receive`]. Changes whose dependencies have not
//! arrived yet are parked, keyed by the `(actor, seq)` they wait for, and
//! applied automatically once that change shows up.

use super::change::{Change, ChangeBuilder, DocumentId};
use super::clock::{ActorId, ClockVector, Seq};
use super::document::{ApplyError, Document};
use super::changelog::DeliveryError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

/// Default cap on deferred changes held per document
pub const DEFAULT_MAX_PENDING: usize = 1024;

pub type SubscriptionId = Uuid;

type Subscriber = Box<dyn Fn(&DocumentId) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("mutation produced no operations")]
    EmptyChange,

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Result of handing a remote change to the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Folded into the document, along with `released` previously deferred changes
    Applied { released: usize },
    /// Already present; nothing changed
    Duplicate,
    /// Parked until `missing` arrives
    Deferred { missing: (ActorId, Seq) },
}

struct Pending {
    change: Change,
    /// Peers that delivered this change
    holders: BTreeSet<ActorId>,
    arrival: u64,
}

#[derive(Default)]
struct Deferred {
    waiting: BTreeMap<(ActorId, Seq), Vec<Pending>>,
}

impl Deferred {
    fn len(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    fn find_mut(&mut self, actor: &str, seq: Seq) -> Option<&mut Pending> {
        self.waiting
            .values_mut()
            .flat_map(|v| v.iter_mut())
            .find(|p| p.change.actor == actor && p.change.seq == seq)
    }

    fn push(&mut self, missing: (ActorId, Seq), pending: Pending) {
        self.waiting.entry(missing).or_default().push(pending);
    }

    fn drain_all(&mut self) -> Vec<Pending> {
        std::mem::take(&mut self.waiting)
            .into_values()
            .flatten()
            .collect()
    }

    fn evict_oldest(&mut self) -> Option<Pending> {
        let (key, index) = self
            .waiting
            .iter()
            .flat_map(|(k, v)| v.iter().enumerate().map(move |(i, p)| (k, i, p.arrival)))
            .min_by_key(|(_, _, arrival)| *arrival)
            .map(|(k, i, _)| (k.clone(), i))?;
        let bucket = self.waiting.get_mut(&key)?;
        let evicted = bucket.remove(index);
        if bucket.is_empty() {
            self.waiting.remove(&key);
        }
        Some(evicted)
    }
}

/// Owns the documents of one replica, keyed by id.
pub struct DocumentRegistry {
    actor: ActorId,
    documents: HashMap<DocumentId, Document>,
    deferred: HashMap<DocumentId, Deferred>,
    /// Changes given up on, kept as a diagnostic of gaps in the history
    discarded: HashMap<DocumentId, Vec<DeliveryError>>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    dirty: BTreeSet<DocumentId>,
    max_pending: usize,
    arrivals: u64,
}

impl DocumentRegistry {
    pub fn new(actor: impl Into<ActorId>) -> Self {
        Self::with_max_pending(actor, DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(actor: impl Into<ActorId>, max_pending: usize) -> Self {
        Self {
            actor: actor.into(),
            documents: HashMap::new(),
            deferred: HashMap::new(),
            discarded: HashMap::new(),
            subscribers: HashMap::new(),
            dirty: BTreeSet::new(),
            max_pending: max_pending.max(1),
            arrivals: 0,
        }
    }

    /// The local actor that authors proposed changes
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Get a document, creating an empty one if absent
    pub fn get(&mut self, id: &str) -> &Document {
        self.document_mut(id)
    }

    /// Get a document without creating it
    pub fn peek(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    fn document_mut(&mut self, id: &str) -> &mut Document {
        self.documents
            .entry(id.to_string())
            .or_insert_with(|| Document::new(id))
    }

    /// Ids of every known document, sorted
    pub fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.documents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current clock of a document (empty if unknown)
    pub fn clock(&self, id: &str) -> ClockVector {
        self.documents
            .get(id)
            .map(|d| d.clock().clone())
            .unwrap_or_default()
    }

    /// Author a new local change.
    ///
    /// The mutator records operations against the current state; the
    /// resulting change is applied, logged, and returned for broadcast.
    pub fn propose<F>(&mut self, id: &str, mutator: F) -> Result<Change, RegistryError>
    where
        F: FnOnce(&mut ChangeBuilder<'_>),
    {
        let actor = self.actor.clone();
        let doc = self.document_mut(id);
        let seq = doc.log().next_seq(&actor);
        let change = {
            let mut tx = ChangeBuilder::new(doc.state(), actor, seq, doc.clock().clone());
            mutator(&mut tx);
            if tx.is_empty() {
                return Err(RegistryError::EmptyChange);
            }
            tx.finish()
        };
        *doc = doc.apply_change(&change)?;
        log::debug!("[{}] proposed {}:{} on {}", self.actor, change.actor, change.seq, id);

        self.dirty.insert(id.to_string());
        self.release(id, change.key());
        self.flush();
        Ok(change)
    }

    /// Apply one remote change
    pub fn receive(&mut self, id: &str, change: Change) -> ApplyOutcome {
        self.receive_from(id, change, None)
    }

    /// Apply one remote change delivered by `source`
    pub fn receive_from(&mut self, id: &str, change: Change, source: Option<&ActorId>) -> ApplyOutcome {
        let outcome = self.apply_remote(id, change, source);
        self.flush();
        outcome
    }

    /// Apply a batch of remote changes, then retry anything still deferred.
    ///
    /// Subscribers hear about each touched document once per batch.
    pub fn receive_batch(
        &mut self,
        id: &str,
        changes: Vec<Change>,
        source: Option<&ActorId>,
    ) -> Vec<ApplyOutcome> {
        let outcomes: Vec<_> = changes
            .into_iter()
            .map(|change| self.apply_remote(id, change, source))
            .collect();
        if outcomes.iter().any(|o| !matches!(o, ApplyOutcome::Duplicate)) {
            self.retry_deferred(id);
        }
        self.flush();
        outcomes
    }

    fn apply_remote(&mut self, id: &str, change: Change, source: Option<&ActorId>) -> ApplyOutcome {
        let doc = self.document_mut(id);
        if doc.has_applied(&change) {
            return ApplyOutcome::Duplicate;
        }
        match doc.apply_change(&change) {
            Ok(next) => {
                *doc = next;
                self.dirty.insert(id.to_string());
                let released = self.release(id, change.key());
                ApplyOutcome::Applied { released }
            }
            Err(ApplyError::NotReady {
                missing_actor,
                missing_seq,
                ..
            }) => {
                let missing = (missing_actor, missing_seq);
                self.defer(id, change, missing.clone(), source);
                ApplyOutcome::Deferred { missing }
            }
        }
    }

    fn defer(&mut self, id: &str, change: Change, missing: (ActorId, Seq), source: Option<&ActorId>) {
        let deferred = self.deferred.entry(id.to_string()).or_default();
        if let Some(existing) = deferred.find_mut(&change.actor, change.seq) {
            if let Some(source) = source {
                existing.holders.insert(source.clone());
            }
            return;
        }

        log::debug!(
            "[{}] deferring {}:{} on {} until {}:{} arrives",
            self.actor,
            change.actor,
            change.seq,
            id,
            missing.0,
            missing.1
        );
        self.arrivals += 1;
        deferred.push(
            missing,
            Pending {
                change,
                holders: source.into_iter().cloned().collect(),
                arrival: self.arrivals,
            },
        );

        if deferred.len() > self.max_pending {
            if let Some(evicted) = deferred.evict_oldest() {
                self.give_up(id, evicted.change);
            }
        }
    }

    /// Record a change we will never apply as a gap in the document's history.
    fn give_up(&mut self, id: &str, change: Change) {
        let clock = self.clock(id);
        let (missing_actor, missing_seq) = change
            .missing_dependency(&clock)
            .unwrap_or_else(|| (change.actor.clone(), change.seq));
        let err = DeliveryError::CausalityViolation {
            actor: change.actor,
            seq: change.seq,
            missing_actor,
            missing_seq,
        };
        log::warn!("[{}] discarding change on {}: {}", self.actor, id, err);
        self.discarded.entry(id.to_string()).or_default().push(err);
    }

    /// Apply every deferred change that was waiting on `key`, transitively.
    fn release(&mut self, id: &str, key: (ActorId, Seq)) -> usize {
        let mut released = 0;
        let mut ready = vec![key];
        while let Some(key) = ready.pop() {
            let waiting = match self.deferred.get_mut(id).and_then(|d| d.waiting.remove(&key)) {
                Some(waiting) => waiting,
                None => continue,
            };
            for pending in waiting {
                if let Some(key) = self.try_pending(id, pending) {
                    released += 1;
                    ready.push(key);
                }
            }
        }
        released
    }

    /// Retry every deferred change of a document until no more progress is made.
    pub fn retry_deferred(&mut self, id: &str) -> usize {
        let mut released = 0;
        loop {
            let pending = match self.deferred.get_mut(id) {
                Some(d) => d.drain_all(),
                None => return released,
            };
            let mut progressed = false;
            for p in pending {
                if let Some(key) = self.try_pending(id, p) {
                    released += 1 + self.release(id, key);
                    progressed = true;
                }
            }
            if !progressed {
                return released;
            }
        }
    }

    /// Try to apply a parked change; re-park it under its next missing
    /// dependency if it is still not ready. Returns its key if applied.
    fn try_pending(&mut self, id: &str, pending: Pending) -> Option<(ActorId, Seq)> {
        let doc = self.document_mut(id);
        if doc.has_applied(&pending.change) {
            return None;
        }
        match doc.apply_change(&pending.change) {
            Ok(next) => {
                *doc = next;
                self.dirty.insert(id.to_string());
                log::debug!(
                    "[{}] applied deferred {}:{} on {}",
                    self.actor,
                    pending.change.actor,
                    pending.change.seq,
                    id
                );
                Some(pending.change.key())
            }
            Err(ApplyError::NotReady {
                missing_actor,
                missing_seq,
                ..
            }) => {
                self.deferred
                    .entry(id.to_string())
                    .or_default()
                    .push((missing_actor, missing_seq), pending);
                None
            }
        }
    }

    /// Forget `source` as a holder of deferred changes; changes no other
    /// peer delivered are dropped and recorded in [`discarded`](Self::discarded).
    /// Returns how many were dropped.
    pub fn release_source(&mut self, source: &ActorId) -> usize {
        let mut dropped = 0;
        for (id, deferred) in self.deferred.iter_mut() {
            for ((missing_actor, missing_seq), bucket) in deferred.waiting.iter_mut() {
                let (orphaned, kept): (Vec<Pending>, Vec<Pending>) = bucket
                    .drain(..)
                    .partition(|p| p.holders.contains(source) && p.holders.len() == 1);
                *bucket = kept;
                for p in bucket.iter_mut() {
                    p.holders.remove(source);
                }
                for p in orphaned {
                    let err = DeliveryError::CausalityViolation {
                        actor: p.change.actor,
                        seq: p.change.seq,
                        missing_actor: missing_actor.clone(),
                        missing_seq: *missing_seq,
                    };
                    log::debug!(
                        "[{}] dropping deferred change on {} (holder {} gone): {}",
                        self.actor,
                        id,
                        source,
                        err
                    );
                    self.discarded.entry(id.clone()).or_default().push(err);
                    dropped += 1;
                }
            }
            deferred.waiting.retain(|_, bucket| !bucket.is_empty());
        }
        dropped
    }

    /// Number of changes parked for a document
    pub fn pending_count(&self, id: &str) -> usize {
        self.deferred.get(id).map(Deferred::len).unwrap_or(0)
    }

    /// Changes that deferred changes of a document are waiting for
    pub fn missing_dependencies(&self, id: &str) -> Vec<(ActorId, Seq)> {
        self.deferred
            .get(id)
            .map(|d| d.waiting.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Changes discarded as causality violations: evicted from a full
    /// deferred buffer, or dropped when the only peer holding them left
    pub fn discarded(&self, id: &str) -> &[DeliveryError] {
        self.discarded.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Register a callback fired with a document id whenever that document changes
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&DocumentId) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.subscribers.insert(id, Box::new(callback));
        id
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        self.subscribers.remove(&subscription).is_some()
    }

    fn flush(&mut self) {
        for id in std::mem::take(&mut self.dirty) {
            for callback in self.subscribers.values() {
                callback(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::change::Value;
    use std::sync::{Arc, Mutex};

    fn authored(actor: &str, n: usize) -> Vec<Change> {
        let mut reg = DocumentRegistry::new(actor);
        (0..n)
            .map(|i| {
                reg.propose("doc1", |tx| {
                    tx.set("x", "n", Value::Int(i as i64));
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_get_creates_empty_document() {
        let mut reg = DocumentRegistry::new("A");
        assert!(reg.peek("doc1").is_none());
        let doc = reg.get("doc1");
        assert!(doc.clock().is_empty());
        assert!(reg.peek("doc1").is_some());
    }

    #[test]
    fn test_propose_sets_seq_and_deps() {
        let mut reg = DocumentRegistry::new("B");
        let remote = authored("A", 2);
        for c in remote {
            reg.receive("doc1", c);
        }

        let change = reg
            .propose("doc1", |tx| {
                tx.set("x", "title", Value::string("y"));
            })
            .unwrap();
        assert_eq!(change.actor, "B");
        assert_eq!(change.seq, 1);
        assert_eq!(change.deps, ClockVector::at("A", 2));
        assert_eq!(reg.clock("doc1").get("B"), 1);
    }

    #[test]
    fn test_empty_mutation_is_rejected() {
        let mut reg = DocumentRegistry::new("A");
        assert_eq!(reg.propose("doc1", |_| {}), Err(RegistryError::EmptyChange));
        assert!(reg.clock("doc1").is_empty());
    }

    #[test]
    fn test_deferred_change_applies_when_dependency_arrives() {
        let changes = authored("A", 3);
        let mut reg = DocumentRegistry::new("B");

        assert_eq!(
            reg.receive("doc1", changes[2].clone()),
            ApplyOutcome::Deferred {
                missing: ("A".into(), 2)
            }
        );
        assert_eq!(
            reg.receive("doc1", changes[1].clone()),
            ApplyOutcome::Deferred {
                missing: ("A".into(), 1)
            }
        );
        assert_eq!(reg.pending_count("doc1"), 2);
        assert!(reg.get("doc1").state().object("x").is_none());

        assert_eq!(
            reg.receive("doc1", changes[0].clone()),
            ApplyOutcome::Applied { released: 2 }
        );
        assert_eq!(reg.pending_count("doc1"), 0);
        assert_eq!(reg.get("doc1").state().field("x", "n"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_duplicate_receive() {
        let changes = authored("A", 1);
        let mut reg = DocumentRegistry::new("B");
        assert!(matches!(
            reg.receive("doc1", changes[0].clone()),
            ApplyOutcome::Applied { .. }
        ));
        assert_eq!(reg.receive("doc1", changes[0].clone()), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_subscribers_notified_once_per_batch() {
        let changes = authored("A", 3);
        let mut reg = DocumentRegistry::new("B");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let sub = reg.subscribe(move |id| sink.lock().unwrap().push(id.clone()));

        reg.receive_batch("doc1", changes.clone(), None);
        assert_eq!(*calls.lock().unwrap(), vec!["doc1".to_string()]);

        // duplicates do not notify
        reg.receive_batch("doc1", changes, None);
        assert_eq!(calls.lock().unwrap().len(), 1);

        assert!(reg.unsubscribe(sub));
        reg.propose("doc1", |tx| {
            tx.set("x", "n", Value::Null);
        })
        .unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_overflow_discards_oldest_as_causality_violation() {
        let changes = authored("A", 4);
        let mut reg = DocumentRegistry::with_max_pending("B", 2);
        reg.receive("doc1", changes[1].clone());
        reg.receive("doc1", changes[2].clone());
        reg.receive("doc1", changes[3].clone());

        assert_eq!(reg.pending_count("doc1"), 2);
        assert_eq!(reg.discarded("doc1").len(), 1);
        assert!(matches!(
            reg.discarded("doc1")[0],
            DeliveryError::CausalityViolation { seq: 2, .. }
        ));
    }

    #[test]
    fn test_release_source_keeps_changes_other_peers_hold() {
        let changes = authored("A", 3);
        let mut reg = DocumentRegistry::new("B");
        let p1: ActorId = "p1".into();
        let p2: ActorId = "p2".into();
        reg.receive_from("doc1", changes[1].clone(), Some(&p1));
        reg.receive_from("doc1", changes[2].clone(), Some(&p1));
        reg.receive_from("doc1", changes[2].clone(), Some(&p2));

        assert_eq!(reg.release_source(&p1), 1);
        assert_eq!(reg.pending_count("doc1"), 1);
        assert_eq!(reg.missing_dependencies("doc1"), vec![("A".to_string(), 2)]);

        assert_eq!(reg.release_source(&p2), 1);
        assert_eq!(reg.pending_count("doc1"), 0);

        let discarded = reg.discarded("doc1");
        assert_eq!(discarded.len(), 2);
        assert!(matches!(
            discarded[0],
            DeliveryError::CausalityViolation { seq: 2, missing_seq: 1, .. }
        ));
        assert!(matches!(
            discarded[1],
            DeliveryError::CausalityViolation { seq: 3, missing_seq: 2, .. }
        ));
    }
}
