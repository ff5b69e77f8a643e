//! Peer connectivity
//!
//! The [`Transport`] trait is the only thing the replication core knows about
//! the network: a way to dial, send and close, plus a stream of
//! [`TransportEvent`]s. An in-process simulator and a TCP implementation are
//! provided; the [`PeerManager`] drives sync sessions over either.

pub mod peer_manager;
pub mod simulated;
pub mod tcp;
pub mod transport;

use thiserror::Error;

use crate::convergent::ActorId;

pub use peer_manager::{ConnectOutcome, Direction, PeerManager, PeerRecord};
pub use simulated::{SimNetwork, SimTransport};
pub use tcp::TcpTransport;
pub use transport::{EventReceiver, EventSender, Transport, TransportEvent};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Link to {0} is closed")]
    Closed(ActorId),

    #[error("Unknown peer {0}")]
    UnknownPeer(ActorId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}
