//! Convergent Document System
//!
//! Leaderless replication of structured documents. Each replica keeps a
//! causally closed log of changes per document and materializes state by
//! folding that log through a deterministic merge, so replicas holding the
//! same set of changes hold the same state whatever order they arrived in.

mod change;
mod clock;
mod document;
mod changelog;
mod registry;

pub use change::{Change, ChangeBuilder, DocumentId, ListId, ObjectId, Op, OpId, Value};
pub use clock::{ActorId, ClockVector, Seq};
pub use document::{apply_change, ApplyError, Document, DocumentState, ObjectState, Sequence};
pub use changelog::{ChangeLog, DeliveryError};
pub use registry::{
    ApplyOutcome, DocumentRegistry, RegistryError, SubscriptionId, DEFAULT_MAX_PENDING,
};
