//! Documents and the merge function
//!
//! A Document is the materialized result of folding its change log through
//! [`apply_change`]. Field writes resolve last-writer-wins by `OpId`, list
//! inserts form a tree anchored on their left neighbour, and deletes leave
//! tombstones that absorb any later field writes.

use super::change::{Change, DocumentId, ListId, ObjectId, Op, OpId, Value};
use super::clock::{ActorId, ClockVector, Seq};
use super::changelog::{ChangeLog, DeliveryError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("change {actor}:{seq} is not ready: waiting for {missing_actor}:{missing_seq}")]
    NotReady {
        actor: ActorId,
        seq: Seq,
        missing_actor: ActorId,
        missing_seq: Seq,
    },
}

/// A field value together with the op that wrote it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldValue {
    pub value: Value,
    pub stamp: OpId,
}

/// Materialized state of a single object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectState {
    fields: BTreeMap<String, FieldValue>,
    deleted: bool,
}

impl ObjectState {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|f| &f.value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(k, f)| (k, &f.value))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn set(&mut self, field: &str, value: &Value, stamp: OpId) {
        if self.deleted {
            return;
        }
        match self.fields.get_mut(field) {
            Some(current) if current.stamp >= stamp => {}
            Some(current) => {
                current.value = value.clone();
                current.stamp = stamp;
            }
            None => {
                self.fields.insert(
                    field.to_string(),
                    FieldValue {
                        value: value.clone(),
                        stamp,
                    },
                );
            }
        }
    }

    fn tombstone(&mut self) {
        self.deleted = true;
        self.fields.clear();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Element {
    /// Left neighbour at insertion time (`None` = head)
    parent: Option<OpId>,
    value: Value,
    removed: bool,
}

/// A replicated list.
///
/// Elements are nodes in a tree keyed by their left neighbour; siblings
/// sort by descending `OpId`, so the most recent insert at a position comes
/// first and concurrent inserts at the same position keep a stable order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sequence {
    nodes: BTreeMap<OpId, Element>,
    /// Linear order of every node, tombstones included
    order: Vec<OpId>,
}

impl Sequence {
    /// Visible elements in order
    pub fn iter(&self) -> impl Iterator<Item = (&OpId, &Value)> {
        self.order.iter().filter_map(move |id| {
            self.nodes
                .get(id)
                .filter(|e| !e.removed)
                .map(|e| (id, &e.value))
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.nodes.values().filter(|e| !e.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.iter().nth(index).map(|(_, v)| v)
    }

    /// Element id of the visible element at `index`
    pub fn id_at(&self, index: usize) -> Option<&OpId> {
        self.iter().nth(index).map(|(id, _)| id)
    }

    /// Id of the last element, tombstones included
    pub fn last_id(&self) -> Option<&OpId> {
        self.order.last()
    }

    /// Element id holding `value`, if visible
    pub fn find(&self, value: &Value) -> Option<&OpId> {
        self.iter().find(|(_, v)| *v == value).map(|(id, _)| id)
    }

    fn insert(&mut self, id: OpId, parent: Option<OpId>, value: Value) -> bool {
        if let Some(p) = &parent {
            if !self.nodes.contains_key(p) {
                log::warn!("insert {:?} references unknown element {:?}; dropped", id, p);
                return false;
            }
        }
        self.nodes.entry(id).or_insert(Element {
            parent,
            value,
            removed: false,
        });
        true
    }

    fn remove(&mut self, id: &OpId) {
        match self.nodes.get_mut(id) {
            Some(e) => e.removed = true,
            None => log::warn!("remove of unknown element {:?}; ignored", id),
        }
    }

    /// Recompute the linear order from the insertion tree.
    fn rebuild(&mut self) {
        let mut children: BTreeMap<Option<&OpId>, Vec<&OpId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            children.entry(node.parent.as_ref()).or_default().push(id);
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        // `nodes` iterates ascending, so each sibling list is ascending;
        // pushing in that order pops the highest id first.
        let mut stack: Vec<&OpId> = children.get(&None).cloned().unwrap_or_default();
        while let Some(id) = stack.pop() {
            order.push(id.clone());
            if let Some(kids) = children.get(&Some(id)) {
                stack.extend(kids.iter().copied());
            }
        }
        self.order = order;
    }
}

/// Materialized state of an entire document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocumentState {
    objects: BTreeMap<ObjectId, ObjectState>,
    lists: BTreeMap<ListId, Sequence>,
}

impl DocumentState {
    /// A live (not deleted) object
    pub fn object(&self, id: &str) -> Option<&ObjectState> {
        self.objects.get(id).filter(|o| !o.deleted)
    }

    pub fn field(&self, object: &str, field: &str) -> Option<&Value> {
        self.object(object).and_then(|o| o.get(field))
    }

    pub fn is_deleted(&self, object: &str) -> bool {
        self.objects.get(object).map(|o| o.deleted).unwrap_or(false)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&ObjectId, &ObjectState)> {
        self.objects.iter().filter(|(_, o)| !o.deleted)
    }

    pub fn list(&self, id: &str) -> Option<&Sequence> {
        self.lists.get(id)
    }

    fn apply_op(&mut self, op: &Op, stamp: OpId, touched: &mut BTreeSet<ListId>) {
        match op {
            Op::Set {
                object,
                field,
                value,
            } => {
                self.objects
                    .entry(object.clone())
                    .or_default()
                    .set(field, value, stamp);
            }
            Op::Insert { list, after, value } => {
                let seq = self.lists.entry(list.clone()).or_default();
                if seq.insert(stamp, after.clone(), value.clone()) {
                    touched.insert(list.clone());
                }
            }
            Op::Remove { list, elem } => match self.lists.get_mut(list) {
                Some(seq) => seq.remove(elem),
                None => log::warn!("remove from unknown list {}; ignored", list),
            },
            Op::Delete { object } => {
                self.objects.entry(object.clone()).or_default().tombstone();
            }
        }
    }
}

/// One replicated document: its change log and the state it materializes to.
#[derive(Clone, Debug)]
pub struct Document {
    id: DocumentId,
    log: ChangeLog,
    state: DocumentState,
}

impl Document {
    /// Create an empty document (empty state, empty clock)
    pub fn new(id: impl Into<DocumentId>) -> Self {
        Self {
            id: id.into(),
            log: ChangeLog::new(),
            state: DocumentState::default(),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn clock(&self) -> &ClockVector {
        self.log.clock()
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn has_applied(&self, change: &Change) -> bool {
        self.log.contains(&change.actor, change.seq)
    }

    /// Changes this document holds that `clock` does not cover, in dependency order
    pub fn changes_since(&self, clock: &ClockVector) -> Vec<Change> {
        self.log.changes_since(clock)
    }

    /// Fold one change into a new document value.
    ///
    /// Re-applying a change already in the log returns an identical document.
    pub fn apply_change(&self, change: &Change) -> Result<Document, ApplyError> {
        let mut next = self.clone();
        match next.log.append(change.clone()) {
            Ok(()) => {}
            Err(DeliveryError::Duplicate { .. }) => return Ok(next),
            Err(DeliveryError::CausalityViolation {
                actor,
                seq,
                missing_actor,
                missing_seq,
            }) => {
                return Err(ApplyError::NotReady {
                    actor,
                    seq,
                    missing_actor,
                    missing_seq,
                })
            }
        }

        let mut touched = BTreeSet::new();
        for (index, op) in change.ops.iter().enumerate() {
            next.state.apply_op(op, change.op_id(index), &mut touched);
        }
        for list in touched {
            if let Some(seq) = next.state.lists.get_mut(&list) {
                seq.rebuild();
            }
        }
        Ok(next)
    }
}

/// Free-function form of [`Document::apply_change`]
pub fn apply_change(doc: &Document, change: &Change) -> Result<Document, ApplyError> {
    doc.apply_change(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::change::ChangeBuilder;

    fn build(doc: &Document, actor: &str, f: impl FnOnce(&mut ChangeBuilder<'_>)) -> Change {
        let seq = doc.log().next_seq(actor);
        let mut tx = ChangeBuilder::new(doc.state(), actor.into(), seq, doc.clock().clone());
        f(&mut tx);
        tx.finish()
    }

    fn list_values(doc: &Document, list: &str) -> Vec<Value> {
        doc.state()
            .list(list)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_set_and_materialize() {
        let doc = Document::new("doc1");
        let c = build(&doc, "A", |tx| {
            tx.set("task_1", "title", Value::string("Hello"));
        });
        let doc = doc.apply_change(&c).unwrap();

        assert_eq!(doc.state().field("task_1", "title"), Some(&Value::string("Hello")));
        assert_eq!(doc.clock().get("A"), 1);
    }

    #[test]
    fn test_apply_leaves_input_document_untouched() {
        let doc = Document::new("doc1");
        let c = build(&doc, "A", |tx| {
            tx.set("x", "f", Value::Int(1));
        });
        let next = apply_change(&doc, &c).unwrap();
        assert!(doc.state().object("x").is_none());
        assert!(next.state().object("x").is_some());
    }

    #[test]
    fn test_not_ready_leaves_state_untouched() {
        let a = Document::new("doc1");
        let c1 = build(&a, "A", |tx| {
            tx.set("x", "f", Value::Int(1));
        });
        let a = a.apply_change(&c1).unwrap();
        let c2 = build(&a, "A", |tx| {
            tx.set("x", "f", Value::Int(2));
        });

        let fresh = Document::new("doc1");
        let err = fresh.apply_change(&c2).unwrap_err();
        assert_eq!(
            err,
            ApplyError::NotReady {
                actor: "A".into(),
                seq: 2,
                missing_actor: "A".into(),
                missing_seq: 1,
            }
        );
    }

    #[test]
    fn test_duplicate_apply_is_idempotent() {
        let doc = Document::new("doc1");
        let c = build(&doc, "A", |tx| {
            tx.push("items", Value::Int(1));
        });
        let once = doc.apply_change(&c).unwrap();
        let twice = once.apply_change(&c).unwrap();
        assert_eq!(once.state(), twice.state());
        assert_eq!(once.clock(), twice.clock());
    }

    #[test]
    fn test_concurrent_field_writes_resolve_by_actor() {
        let base = Document::new("doc1");
        let from_a = build(&base, "A", |tx| {
            tx.set("x", "title", Value::string("a"));
        });
        let from_b = build(&base, "B", |tx| {
            tx.set("x", "title", Value::string("b"));
        });

        let ab = base.apply_change(&from_a).unwrap().apply_change(&from_b).unwrap();
        let ba = base.apply_change(&from_b).unwrap().apply_change(&from_a).unwrap();
        assert_eq!(ab.state(), ba.state());
        assert_eq!(ab.state().field("x", "title"), Some(&Value::string("b")));
    }

    #[test]
    fn test_causally_later_write_wins_over_higher_actor() {
        let base = Document::new("doc1");
        let from_z = build(&base, "Z", |tx| {
            tx.set("x", "title", Value::string("z"));
        });
        let after_z = base.apply_change(&from_z).unwrap();
        let from_a = build(&after_z, "A", |tx| {
            tx.set("x", "title", Value::string("a"));
        });
        let doc = after_z.apply_change(&from_a).unwrap();
        assert_eq!(doc.state().field("x", "title"), Some(&Value::string("a")));
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_both_survive() {
        let base = Document::new("doc1");
        let head = build(&base, "A", |tx| {
            tx.push("items", Value::Int(0));
        });
        let base = base.apply_change(&head).unwrap();

        let from_a = build(&base, "A", |tx| {
            tx.push("items", Value::Int(1));
        });
        let from_b = build(&base, "B", |tx| {
            tx.push("items", Value::Int(2));
        });

        let ab = base.apply_change(&from_a).unwrap().apply_change(&from_b).unwrap();
        let ba = base.apply_change(&from_b).unwrap().apply_change(&from_a).unwrap();
        assert_eq!(list_values(&ab, "items"), list_values(&ba, "items"));
        assert_eq!(list_values(&ab, "items").len(), 3);
        assert_eq!(list_values(&ab, "items")[0], Value::Int(0));
    }

    #[test]
    fn test_insert_after_places_element_right_of_anchor() {
        let doc = Document::new("doc1");
        let c1 = build(&doc, "A", |tx| {
            tx.push("items", Value::Int(1));
            tx.push("items", Value::Int(3));
        });
        let doc = doc.apply_change(&c1).unwrap();
        let first = doc.state().list("items").unwrap().id_at(0).cloned();
        let c2 = build(&doc, "A", |tx| {
            tx.insert_after("items", first, Value::Int(2));
        });
        let doc = doc.apply_change(&c2).unwrap();
        assert_eq!(
            list_values(&doc, "items"),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn test_remove_hides_element() {
        let doc = Document::new("doc1");
        let c1 = build(&doc, "A", |tx| {
            tx.push("items", Value::Int(1));
            tx.push("items", Value::Int(2));
        });
        let doc = doc.apply_change(&c1).unwrap();
        let first = doc.state().list("items").unwrap().id_at(0).cloned().unwrap();
        let c2 = build(&doc, "A", |tx| {
            tx.remove("items", first);
        });
        let doc = doc.apply_change(&c2).unwrap();
        assert_eq!(list_values(&doc, "items"), vec![Value::Int(2)]);
    }

    #[test]
    fn test_delete_wins_over_concurrent_edit() {
        let base = Document::new("doc1");
        let create = build(&base, "A", |tx| {
            tx.set("x", "title", Value::string("t"));
        });
        let base = base.apply_change(&create).unwrap();

        let delete = build(&base, "A", |tx| {
            tx.delete("x");
        });
        let edit = build(&base, "B", |tx| {
            tx.set("x", "title", Value::string("edited"));
        });

        let de = base.apply_change(&delete).unwrap().apply_change(&edit).unwrap();
        let ed = base.apply_change(&edit).unwrap().apply_change(&delete).unwrap();
        assert!(de.state().is_deleted("x"));
        assert!(de.state().object("x").is_none());
        assert_eq!(de.state(), ed.state());
    }
}
