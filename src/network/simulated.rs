//! In-process network simulator
//!
//! Every replica that joins a [`SimNetwork`] gets a [`SimTransport`] and an
//! event receiver. Links are symmetric and deliver bytes in order, which is
//! exactly what the sync protocol assumes of a real transport. Used by the
//! integration tests to run several replicas in one process.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::transport::{EventReceiver, EventSender, Transport, TransportEvent};
use super::TransportError;
use crate::convergent::ActorId;

#[derive(Default)]
struct SimState {
    endpoints: HashMap<ActorId, EventSender>,
    /// Open links, stored as (lower id, higher id)
    links: BTreeSet<(ActorId, ActorId)>,
    /// Split every send into chunks of this size
    chunk_size: Option<usize>,
}

impl SimState {
    fn deliver(&self, to: &ActorId, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(to) {
            let _ = tx.send(event);
        }
    }

    fn drop_link(&mut self, a: &ActorId, b: &ActorId) -> bool {
        if self.links.remove(&link_key(a, b)) {
            self.deliver(a, TransportEvent::Closed(b.clone()));
            self.deliver(b, TransportEvent::Closed(a.clone()));
            true
        } else {
            false
        }
    }
}

fn link_key(a: &ActorId, b: &ActorId) -> (ActorId, ActorId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// The simulated medium shared by all joined transports.
#[derive(Default)]
pub struct SimNetwork {
    state: Mutex<SimState>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new endpoint to the network.
    pub fn join(self: &Arc<Self>, id: impl Into<ActorId>) -> (Arc<SimTransport>, EventReceiver) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().endpoints.insert(id.clone(), tx);
        let transport = Arc::new(SimTransport {
            id,
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Detach an endpoint, closing all of its links.
    pub fn leave(&self, id: &ActorId) {
        let mut state = self.lock();
        let linked: Vec<ActorId> = state
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        for peer in linked {
            state.drop_link(id, &peer);
        }
        state.endpoints.remove(id);
    }

    /// Cut the link between two endpoints, as if the connection failed.
    pub fn sever(&self, a: &ActorId, b: &ActorId) -> bool {
        self.lock().drop_link(a, b)
    }

    /// Deliver every send in chunks of at most `size` bytes (`None` = whole).
    pub fn set_chunk_size(&self, size: Option<usize>) {
        self.lock().chunk_size = size.filter(|s| *s > 0);
    }

    pub fn is_linked(&self, a: &ActorId, b: &ActorId) -> bool {
        self.lock().links.contains(&link_key(a, b))
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }
}

/// One endpoint on a [`SimNetwork`].
pub struct SimTransport {
    id: ActorId,
    network: Arc<SimNetwork>,
}

impl Transport for SimTransport {
    fn local_id(&self) -> &ActorId {
        &self.id
    }

    fn dial(&self, peer: &ActorId) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        if !state.endpoints.contains_key(peer) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        if !state.links.insert(link_key(&self.id, peer)) {
            return Ok(());
        }
        state.deliver(peer, TransportEvent::IncomingConnection(self.id.clone()));
        state.deliver(peer, TransportEvent::Open(self.id.clone()));
        state.deliver(&self.id, TransportEvent::Open(peer.clone()));
        Ok(())
    }

    fn send(&self, peer: &ActorId, data: Vec<u8>) -> Result<(), TransportError> {
        let state = self.network.lock();
        if !state.links.contains(&link_key(&self.id, peer)) {
            return Err(TransportError::Closed(peer.clone()));
        }
        match state.chunk_size {
            Some(size) => {
                for chunk in data.chunks(size) {
                    state.deliver(peer, TransportEvent::Data(self.id.clone(), chunk.to_vec()));
                }
            }
            None => state.deliver(peer, TransportEvent::Data(self.id.clone(), data)),
        }
        Ok(())
    }

    fn close(&self, peer: &ActorId) {
        let mut state = self.network.lock();
        if state.links.remove(&link_key(&self.id, peer)) {
            state.deliver(peer, TransportEvent::Closed(self.id.clone()));
        }
    }
}
