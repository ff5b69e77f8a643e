//! PeerManager: owns the live peer connections of one replica
//!
//! Maps transport events onto per-peer [`SyncSession`]s and sends whatever
//! those sessions produce. There is exactly one [`PeerRecord`] per remote
//! actor no matter which side dialed, or whether both did at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::transport::{Transport, TransportEvent};
use super::TransportError;
use crate::convergent::{ActorId, DocumentId, DocumentRegistry};
use crate::sync::{SessionConfig, SessionStatus, SyncMessage, SyncSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialed
    Outbound,
    /// They dialed
    Inbound,
}

/// Result of a connect request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new record was created and the transport is dialing
    Dialing,
    /// A new record was created for a link the peer opened
    Accepted,
    /// A record for this peer already exists
    AlreadyConnected,
    /// The peer is ourselves
    Ignored,
}

pub struct PeerRecord {
    pub peer_id: ActorId,
    pub session: SyncSession,
    pub connected_at: DateTime<Utc>,
    pub direction: Direction,
}

pub struct PeerManager {
    transport: Arc<dyn Transport>,
    peers: BTreeMap<ActorId, PeerRecord>,
    /// Rendezvous peer learned from the identity service
    primary: Option<ActorId>,
    session_config: SessionConfig,
}

impl PeerManager {
    pub fn new(transport: Arc<dyn Transport>, session_config: SessionConfig) -> Self {
        Self {
            transport,
            peers: BTreeMap::new(),
            primary: None,
            session_config,
        }
    }

    pub fn local_id(&self) -> &ActorId {
        self.transport.local_id()
    }

    /// Remember the rendezvous peer. Only the first one sticks.
    pub fn set_primary(&mut self, peer: ActorId) {
        if self.primary.is_none() && peer != *self.local_id() {
            log::info!("[{}] primary peer is {}", self.local_id(), peer);
            self.primary = Some(peer);
        }
    }

    pub fn primary(&self) -> Option<&ActorId> {
        self.primary.as_ref()
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn record(&self, peer: &str) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn peer_ids(&self) -> Vec<ActorId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Open a session with a peer. A second call for the same peer is a no-op.
    pub fn connect(&mut self, peer: &ActorId) -> Result<ConnectOutcome, TransportError> {
        if peer == self.local_id() {
            return Ok(ConnectOutcome::Ignored);
        }
        if self.peers.contains_key(peer) {
            log::debug!("[{}] already connected to {}", self.local_id(), peer);
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        self.transport.dial(peer)?;
        self.insert(peer, Direction::Outbound);
        Ok(ConnectOutcome::Dialing)
    }

    /// The peer dialed us: take the same path as `connect`, minus the dial.
    fn accept(&mut self, peer: &ActorId) -> ConnectOutcome {
        if peer == self.local_id() {
            return ConnectOutcome::Ignored;
        }
        if self.peers.contains_key(peer) {
            log::debug!("[{}] {} connected while a session exists", self.local_id(), peer);
            return ConnectOutcome::AlreadyConnected;
        }
        self.insert(peer, Direction::Inbound);
        ConnectOutcome::Accepted
    }

    fn insert(&mut self, peer: &ActorId, direction: Direction) {
        log::info!("[{}] new {:?} peer {}", self.local_id(), direction, peer);
        let record = PeerRecord {
            peer_id: peer.clone(),
            session: SyncSession::new(peer.clone(), self.session_config.clone()),
            connected_at: Utc::now(),
            direction,
        };
        self.peers.insert(peer.clone(), record);
    }

    /// Close the session and drop the record. Unknown peers are ignored.
    pub fn disconnect(&mut self, peer: &ActorId, registry: &mut DocumentRegistry) -> bool {
        if !self.remove(peer, registry) {
            return false;
        }
        self.transport.close(peer);
        true
    }

    /// Drop the record after the transport reported the link gone. The
    /// link may already have been replaced by a newer one, so it is left alone.
    fn link_closed(&mut self, peer: &ActorId, registry: &mut DocumentRegistry) {
        if !self.remove(peer, registry) {
            log::debug!("[{}] {} closed without a record", self.local_id(), peer);
        }
    }

    fn remove(&mut self, peer: &ActorId, registry: &mut DocumentRegistry) -> bool {
        let Some(mut record) = self.peers.remove(peer) else {
            return false;
        };
        record.session.close();

        let dropped = registry.release_source(peer);
        if dropped > 0 {
            log::debug!(
                "[{}] dropped {} deferred change(s) only {} held",
                self.local_id(),
                dropped,
                peer
            );
        }
        if self.primary.as_ref() == Some(peer) {
            log::warn!(
                "[{}] lost connection to primary {}; documents remain usable locally",
                self.local_id(),
                peer
            );
        }
        log::info!("[{}] disconnected from {}", self.local_id(), peer);
        true
    }

    /// Dispatch one transport event.
    pub fn handle_event(&mut self, event: TransportEvent, registry: &mut DocumentRegistry) {
        match event {
            TransportEvent::IncomingConnection(peer) => {
                self.accept(&peer);
            }
            TransportEvent::Open(peer) => {
                let out = match self.peers.get_mut(&peer) {
                    Some(record) => record.session.open(registry),
                    None => {
                        log::debug!("[{}] link to {} opened without a record", self.local_id(), peer);
                        return;
                    }
                };
                self.send(&peer, out);
            }
            TransportEvent::Data(peer, data) => self.receive(&peer, &data, registry),
            TransportEvent::Closed(peer) => self.link_closed(&peer, registry),
        }
    }

    fn receive(&mut self, peer: &ActorId, data: &[u8], registry: &mut DocumentRegistry) {
        let before: BTreeMap<DocumentId, _> = registry
            .document_ids()
            .into_iter()
            .map(|id| {
                let clock = registry.clock(&id);
                (id, clock)
            })
            .collect();

        let out = match self.peers.get_mut(peer) {
            Some(record) => record.session.receive_bytes(data, registry),
            None => {
                log::debug!("[{}] dropping data from unknown peer {}", self.local_id(), peer);
                return;
            }
        };
        self.send(peer, out);

        // changes learned from this peer may be news to the others
        for id in registry.document_ids() {
            if before.get(&id) != Some(&registry.clock(&id)) {
                self.on_document_changed(&id, registry, Some(peer));
            }
        }
    }

    /// Let every session (except `except`) know a document changed.
    pub fn on_document_changed(
        &mut self,
        doc_id: &str,
        registry: &mut DocumentRegistry,
        except: Option<&ActorId>,
    ) {
        let mut outgoing = Vec::new();
        for (peer, record) in self.peers.iter_mut() {
            if Some(peer) == except {
                continue;
            }
            let out = record.session.on_document_changed(doc_id, registry);
            if !out.is_empty() {
                outgoing.push((peer.clone(), out));
            }
        }
        for (peer, out) in outgoing {
            self.send(&peer, out);
        }
    }

    fn send(&self, peer: &ActorId, messages: Vec<SyncMessage>) {
        for msg in messages {
            let frame = match msg.encode_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("[{}] failed to encode message for {}: {}", self.local_id(), peer, e);
                    continue;
                }
            };
            if let Err(e) = self.transport.send(peer, frame) {
                log::warn!("[{}] send to {} failed: {}", self.local_id(), peer, e);
            }
        }
    }

    pub fn status(&self, registry: &DocumentRegistry) -> Vec<SessionStatus> {
        self.peers
            .values()
            .map(|record| record.session.status(registry))
            .collect()
    }
}
