//! Changes and the primitive operations they carry

use super::clock::{ActorId, ClockVector, Seq};
use super::document::DocumentState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a replicated document
pub type DocumentId = String;

/// Identifier of an object (a record of fields) within a document
pub type ObjectId = String;

/// Identifier of a list within a document
pub type ListId = String;

/// A value that can be stored in fields or list elements
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Reference to another object in the same document
    Ref(ObjectId),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&ObjectId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }
}

/// Identity of one operation.
///
/// Ordering is `(depth, actor, seq, index)`. `depth` is the number of
/// changes in the authoring change's causal past (itself included), so a
/// causally later operation always compares greater, and concurrent
/// operations fall back to actor id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub depth: u64,
    pub actor: ActorId,
    pub seq: Seq,
    pub index: u32,
}

/// The primitive operations
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Set a field on an object, creating the object if needed (last-writer-wins)
    Set {
        object: ObjectId,
        field: String,
        value: Value,
    },

    /// Insert an element right after `after` (`None` = list head).
    /// The element is identified by this operation's `OpId`.
    Insert {
        list: ListId,
        after: Option<OpId>,
        value: Value,
    },

    /// Tombstone a list element
    Remove { list: ListId, elem: OpId },

    /// Tombstone an object; concurrent and later field sets are dropped
    Delete { object: ObjectId },
}

/// An atomic, causally tagged unit of edit history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Authoring actor
    pub actor: ActorId,

    /// Position within the author's log (1-based, gapless)
    pub seq: Seq,

    /// Highest seq seen from every other actor when this change was made
    pub deps: ClockVector,

    /// The operations, applied in order
    pub ops: Vec<Op>,
}

impl Change {
    /// `(actor, seq)` key of this change
    pub fn key(&self) -> (ActorId, Seq) {
        (self.actor.clone(), self.seq)
    }

    /// Number of changes in this change's causal past, itself included
    pub fn depth(&self) -> u64 {
        self.seq + self.deps.without(&self.actor).total()
    }

    /// Identity of the op at `index`
    pub fn op_id(&self, index: usize) -> OpId {
        OpId {
            depth: self.depth(),
            actor: self.actor.clone(),
            seq: self.seq,
            index: index as u32,
        }
    }

    /// First dependency not yet covered by `clock`, if any.
    ///
    /// The author's own previous change is an implicit dependency.
    pub fn missing_dependency(&self, clock: &ClockVector) -> Option<(ActorId, Seq)> {
        if self.seq > 1 && clock.get(&self.actor) < self.seq - 1 {
            return Some((self.actor.clone(), self.seq - 1));
        }
        self.deps
            .iter()
            .filter(|(actor, _)| **actor != self.actor)
            .find(|(actor, seq)| clock.get(actor) < *seq)
            .map(|(actor, seq)| (actor.clone(), seq))
    }

    /// Whether this change happened before `other`
    pub fn happened_before(&self, other: &Change) -> bool {
        if self.actor == other.actor {
            self.seq < other.seq
        } else {
            other.deps.has_seen(&self.actor, self.seq)
        }
    }
}

/// Collects operations for one new local change.
///
/// Handed to the mutator passed to `DocumentRegistry::propose`; the
/// current materialized state is readable through [`ChangeBuilder::state`].
pub struct ChangeBuilder<'a> {
    state: &'a DocumentState,
    actor: ActorId,
    seq: Seq,
    deps: ClockVector,
    depth: u64,
    ops: Vec<Op>,
    /// Last element inserted by this builder per list, for `push`
    tails: HashMap<ListId, OpId>,
}

impl<'a> ChangeBuilder<'a> {
    pub fn new(state: &'a DocumentState, actor: ActorId, seq: Seq, deps: ClockVector) -> Self {
        let deps = deps.without(&actor);
        let depth = seq + deps.total();
        Self {
            state,
            actor,
            seq,
            deps,
            depth,
            ops: Vec::new(),
            tails: HashMap::new(),
        }
    }

    /// State the change is being built against
    pub fn state(&self) -> &'a DocumentState {
        self.state
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    fn next_op_id(&self) -> OpId {
        OpId {
            depth: self.depth,
            actor: self.actor.clone(),
            seq: self.seq,
            index: self.ops.len() as u32,
        }
    }

    /// Set a field on an object
    pub fn set(
        &mut self,
        object: impl Into<ObjectId>,
        field: impl Into<String>,
        value: Value,
    ) -> &mut Self {
        self.ops.push(Op::Set {
            object: object.into(),
            field: field.into(),
            value,
        });
        self
    }

    /// Insert `value` after element `after` (`None` inserts at the head)
    pub fn insert_after(
        &mut self,
        list: impl Into<ListId>,
        after: Option<OpId>,
        value: Value,
    ) -> OpId {
        let list = list.into();
        let id = self.next_op_id();
        self.ops.push(Op::Insert {
            list: list.clone(),
            after,
            value,
        });
        self.tails.insert(list, id.clone());
        id
    }

    /// Append `value` at the end of a list
    pub fn push(&mut self, list: impl Into<ListId>, value: Value) -> OpId {
        let list = list.into();
        let after = match self.tails.get(&list) {
            Some(id) => Some(id.clone()),
            None => self.state.list(&list).and_then(|seq| seq.last_id().cloned()),
        };
        self.insert_after(list, after, value)
    }

    /// Remove a list element
    pub fn remove(&mut self, list: impl Into<ListId>, elem: OpId) -> &mut Self {
        self.ops.push(Op::Remove {
            list: list.into(),
            elem,
        });
        self
    }

    /// Delete an object
    pub fn delete(&mut self, object: impl Into<ObjectId>) -> &mut Self {
        self.ops.push(Op::Delete {
            object: object.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn finish(self) -> Change {
        Change {
            actor: self.actor,
            seq: self.seq,
            deps: self.deps,
            ops: self.ops,
        }
    }
}
