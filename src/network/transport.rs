//! Transport contract
//!
//! Implementations own the actual links. Everything they observe is
//! reported as a [`TransportEvent`] on an unbounded channel that the replica's
//! control task drains; every call on the trait returns immediately.

use tokio::sync::mpsc;

use super::TransportError;
use crate::convergent::ActorId;

/// Something that happened on a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer opened a link to us
    IncomingConnection(ActorId),
    /// The link to a peer is ready to carry data
    Open(ActorId),
    /// Bytes arrived from a peer (not necessarily whole frames)
    Data(ActorId, Vec<u8>),
    /// The link to a peer went away
    Closed(ActorId),
}

impl TransportEvent {
    pub fn peer(&self) -> &ActorId {
        match self {
            TransportEvent::IncomingConnection(p)
            | TransportEvent::Open(p)
            | TransportEvent::Data(p, _)
            | TransportEvent::Closed(p) => p,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Fire-and-forget link operations.
pub trait Transport: Send + Sync {
    /// Identity this transport announces to peers
    fn local_id(&self) -> &ActorId;

    /// Start opening a link; completion is reported as [`TransportEvent::Open`].
    /// Dialing a peer that is already linked does nothing.
    fn dial(&self, peer: &ActorId) -> Result<(), TransportError>;

    /// Queue bytes for a peer
    fn send(&self, peer: &ActorId, data: Vec<u8>) -> Result<(), TransportError>;

    /// Drop the link to a peer. Only the remote side observes `Closed`.
    fn close(&self, peer: &ActorId);
}
