//! SyncSession: per-peer protocol state machine
//!
//! A session never touches the network itself. Every entry point returns
//! the messages that should go to the peer; the owner (normally the
//! `PeerManager`) encodes and sends them. Each side tracks what it believes
//! the other side holds, per document, and sends exactly the changes that
//! belief says are missing.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::message::{FrameDecoder, SyncMessage, WireError};
use crate::convergent::{ActorId, ClockVector, DocumentId, DocumentRegistry, Seq};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Created, link not yet open
    Idle,
    /// Clocks differ or changes are outstanding
    Negotiating,
    /// Both sides hold the same changes for every shared document
    Synchronized,
    /// Terminal
    Closed,
}

/// Tuning knobs for a session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Negotiating longer than this is reported as stuck
    pub stuck_after: Duration,
    /// Largest accepted frame
    pub max_frame: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(10),
            max_frame: super::message::DEFAULT_MAX_FRAME,
        }
    }
}

/// Diagnostic snapshot of one session
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub peer: ActorId,
    pub state: SessionState,
    /// Documents whose clocks still differ between us and the peer
    pub outstanding: Vec<DocumentId>,
    /// Changes our deferred buffer is waiting on, per document
    pub missing: Vec<(DocumentId, ActorId, Seq)>,
    /// Negotiating for longer than the configured threshold
    pub stuck: bool,
    /// Frames dropped because they failed to decode
    pub malformed: u64,
}

pub struct SyncSession {
    peer: ActorId,
    state: SessionState,
    config: SessionConfig,
    decoder: FrameDecoder,
    /// What we believe the peer holds
    their_clocks: BTreeMap<DocumentId, ClockVector>,
    /// Our clock as last sent to the peer
    advertised: BTreeMap<DocumentId, ClockVector>,
    negotiating_since: Option<Instant>,
    malformed: u64,
}

impl SyncSession {
    pub fn new(peer: impl Into<ActorId>, config: SessionConfig) -> Self {
        let decoder = FrameDecoder::new(config.max_frame);
        Self {
            peer: peer.into(),
            state: SessionState::Idle,
            config,
            decoder,
            their_clocks: BTreeMap::new(),
            advertised: BTreeMap::new(),
            negotiating_since: None,
            malformed: 0,
        }
    }

    pub fn peer(&self) -> &ActorId {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Our current belief about the peer's clock for a document
    pub fn their_clock(&self, doc_id: &str) -> Option<&ClockVector> {
        self.their_clocks.get(doc_id)
    }

    /// The link is up: start negotiating by advertising every document we hold.
    ///
    /// Opening an already open session restarts negotiation from scratch.
    pub fn open(&mut self, registry: &mut DocumentRegistry) -> Vec<SyncMessage> {
        if self.is_closed() {
            return Vec::new();
        }
        log::debug!("[{}] opening session with {}", registry.actor(), self.peer);
        self.their_clocks.clear();
        self.advertised.clear();
        self.enter_negotiating();

        let out: Vec<SyncMessage> = registry
            .document_ids()
            .into_iter()
            .map(|id| {
                let clock = registry.clock(&id);
                self.advertised.insert(id.clone(), clock.clone());
                SyncMessage::advertise(id, clock)
            })
            .collect();
        self.refresh_state(registry);
        out
    }

    /// Feed raw bytes from the link.
    ///
    /// Frames that fail to decode are logged and dropped; the session stays open.
    pub fn receive_bytes(&mut self, data: &[u8], registry: &mut DocumentRegistry) -> Vec<SyncMessage> {
        if self.is_closed() {
            log::debug!("[{}] dropping {} bytes from {}: session closed", registry.actor(), data.len(), self.peer);
            return Vec::new();
        }
        self.decoder.extend(data);

        let mut out = Vec::new();
        loop {
            let payload = match self.decoder.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    self.note_malformed(registry.actor(), &e);
                    continue;
                }
            };
            match SyncMessage::from_cbor(&payload) {
                Ok(msg) => out.extend(self.handle_message(msg, registry)),
                Err(e) => self.note_malformed(registry.actor(), &e),
            }
        }
        out
    }

    fn note_malformed(&mut self, local: &ActorId, err: &WireError) {
        self.malformed += 1;
        log::warn!("[{}] dropping message from {}: {}", local, self.peer, err);
    }

    /// Handle one decoded message.
    pub fn handle_message(&mut self, msg: SyncMessage, registry: &mut DocumentRegistry) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        match self.state {
            SessionState::Closed => return out,
            // a peer that talks first opens the session implicitly
            SessionState::Idle => out.extend(self.open(registry)),
            SessionState::Negotiating | SessionState::Synchronized => {}
        }

        let SyncMessage {
            doc_id,
            clock,
            changes,
            ..
        } = msg;

        let theirs = self.their_clocks.entry(doc_id.clone()).or_default();
        theirs.merge(&clock);
        for change in &changes {
            theirs.observe(&change.actor, change.seq);
        }

        if !changes.is_empty() {
            log::debug!(
                "[{}] received {} change(s) for {} from {}",
                registry.actor(),
                changes.len(),
                doc_id,
                self.peer
            );
            registry.receive_batch(&doc_id, changes, Some(&self.peer));
        }

        out.extend(self.diff(&doc_id, registry));
        self.refresh_state(registry);
        out
    }

    /// A document changed locally (or through another session): re-run the diff.
    pub fn on_document_changed(&mut self, doc_id: &str, registry: &mut DocumentRegistry) -> Vec<SyncMessage> {
        match self.state {
            SessionState::Idle | SessionState::Closed => return Vec::new(),
            SessionState::Synchronized => self.enter_negotiating(),
            SessionState::Negotiating => {}
        }
        let out: Vec<_> = self.diff(doc_id, registry).into_iter().collect();
        self.refresh_state(registry);
        out
    }

    /// What the peer needs from us for one document, if anything.
    fn diff(&mut self, doc_id: &str, registry: &mut DocumentRegistry) -> Option<SyncMessage> {
        let ours = registry.clock(doc_id);
        let theirs = self.their_clocks.entry(doc_id.to_string()).or_default();

        let missing = registry.get(doc_id).changes_since(theirs);
        if !missing.is_empty() {
            // the link is reliable and ordered, so assume delivery
            for change in &missing {
                theirs.observe(&change.actor, change.seq);
            }
            self.advertised.insert(doc_id.to_string(), ours.clone());
            return Some(SyncMessage::batch(doc_id, ours, missing));
        }

        // nothing to give; ask for what they have if we have not already
        if ours != *theirs && self.advertised.get(doc_id) != Some(&ours) {
            self.advertised.insert(doc_id.to_string(), ours.clone());
            return Some(SyncMessage::advertise(doc_id, ours));
        }
        None
    }

    fn outstanding(&self, registry: &DocumentRegistry) -> Vec<DocumentId> {
        let docs: BTreeSet<DocumentId> = registry
            .document_ids()
            .into_iter()
            .chain(self.their_clocks.keys().cloned())
            .collect();
        docs.into_iter()
            .filter(|id| {
                let theirs = self.their_clocks.get(id).cloned().unwrap_or_default();
                registry.clock(id) != theirs || registry.pending_count(id) > 0
            })
            .collect()
    }

    fn enter_negotiating(&mut self) {
        if self.state != SessionState::Negotiating {
            self.state = SessionState::Negotiating;
            self.negotiating_since = Some(Instant::now());
        }
    }

    fn refresh_state(&mut self, registry: &DocumentRegistry) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            return;
        }
        if self.outstanding(registry).is_empty() {
            if self.state != SessionState::Synchronized {
                log::debug!("[{}] synchronized with {}", registry.actor(), self.peer);
            }
            self.state = SessionState::Synchronized;
            self.negotiating_since = None;
        } else {
            self.enter_negotiating();
        }
    }

    /// Terminal: no further sends or receives are processed.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        self.negotiating_since = None;
        self.their_clocks.clear();
        self.advertised.clear();
        self.decoder.clear();
    }

    pub fn is_stuck(&self) -> bool {
        match (self.state, self.negotiating_since) {
            (SessionState::Negotiating, Some(since)) => since.elapsed() >= self.config.stuck_after,
            _ => false,
        }
    }

    pub fn status(&self, registry: &DocumentRegistry) -> SessionStatus {
        let outstanding = if self.is_closed() {
            Vec::new()
        } else {
            self.outstanding(registry)
        };
        let missing = outstanding
            .iter()
            .flat_map(|id| {
                registry
                    .missing_dependencies(id)
                    .into_iter()
                    .map(move |(actor, seq)| (id.clone(), actor, seq))
            })
            .collect();
        let stuck = self.is_stuck();
        if stuck {
            log::warn!(
                "[{}] session with {} stuck negotiating {:?}",
                registry.actor(),
                self.peer,
                outstanding
            );
        }
        SessionStatus {
            peer: self.peer.clone(),
            state: self.state,
            outstanding,
            missing,
            stuck,
            malformed: self.malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::Value;

    fn add(reg: &mut DocumentRegistry, title: &str) {
        reg.propose("doc1", |tx| {
            tx.set(title, "title", Value::string(title));
        })
        .unwrap();
    }

    /// Deliver messages back and forth until both sides go quiet.
    fn pump(
        a: (&mut SyncSession, &mut DocumentRegistry),
        b: (&mut SyncSession, &mut DocumentRegistry),
        mut to_b: Vec<SyncMessage>,
        mut to_a: Vec<SyncMessage>,
    ) -> usize {
        let (sa, ra) = a;
        let (sb, rb) = b;
        let mut rounds = 0;
        while !(to_a.is_empty() && to_b.is_empty()) {
            rounds += 1;
            assert!(rounds < 20, "sessions never went quiet");
            let next_b: Vec<_> = to_b.drain(..).flat_map(|m| sb.handle_message(m, rb)).collect();
            let next_a: Vec<_> = to_a.drain(..).flat_map(|m| sa.handle_message(m, ra)).collect();
            to_a.extend(next_b);
            to_b.extend(next_a);
        }
        rounds
    }

    #[test]
    fn test_open_advertises_every_document() {
        let mut reg = DocumentRegistry::new("A");
        add(&mut reg, "x");
        reg.get("doc2");
        let mut session = SyncSession::new("B", SessionConfig::default());

        let out = session.open(&mut reg);
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(SyncMessage::is_advertisement));
        assert_eq!(out[0].clock, ClockVector::at("A", 1));
    }

    #[test]
    fn test_sessions_exchange_missing_changes() {
        let mut ra = DocumentRegistry::new("A");
        let mut rb = DocumentRegistry::new("B");
        add(&mut ra, "x");
        add(&mut rb, "y");
        let mut sa = SyncSession::new("B", SessionConfig::default());
        let mut sb = SyncSession::new("A", SessionConfig::default());

        let to_b = sa.open(&mut ra);
        let to_a = sb.open(&mut rb);
        pump((&mut sa, &mut ra), (&mut sb, &mut rb), to_b, to_a);

        assert_eq!(ra.clock("doc1"), rb.clock("doc1"));
        assert_eq!(ra.get("doc1").state(), rb.get("doc1").state());
        assert_eq!(sa.state(), SessionState::Synchronized);
        assert_eq!(sb.state(), SessionState::Synchronized);
    }

    #[test]
    fn test_batch_sends_only_what_peer_lacks() {
        let mut ra = DocumentRegistry::new("A");
        add(&mut ra, "x");
        add(&mut ra, "y");
        let mut sa = SyncSession::new("B", SessionConfig::default());
        sa.open(&mut ra);

        let out = sa.handle_message(SyncMessage::advertise("doc1", ClockVector::at("A", 1)), &mut ra);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].changes.len(), 1);
        assert_eq!(out[0].changes[0].seq, 2);
    }

    #[test]
    fn test_local_change_is_pushed_to_synchronized_peer() {
        let mut ra = DocumentRegistry::new("A");
        let mut rb = DocumentRegistry::new("B");
        let mut sa = SyncSession::new("B", SessionConfig::default());
        let mut sb = SyncSession::new("A", SessionConfig::default());
        let to_b = sa.open(&mut ra);
        let to_a = sb.open(&mut rb);
        pump((&mut sa, &mut ra), (&mut sb, &mut rb), to_b, to_a);

        add(&mut ra, "x");
        let to_b = sa.on_document_changed("doc1", &mut ra);
        assert_eq!(to_b.len(), 1);
        pump((&mut sa, &mut ra), (&mut sb, &mut rb), to_b, Vec::new());

        assert_eq!(rb.clock("doc1").get("A"), 1);
        assert_eq!(sb.state(), SessionState::Synchronized);
    }

    #[test]
    fn test_malformed_bytes_are_dropped_and_session_stays_open() {
        let mut reg = DocumentRegistry::new("A");
        let mut session = SyncSession::new("B", SessionConfig::default());
        session.open(&mut reg);

        let out = session.receive_bytes(&super::super::message::frame(b"not cbor"), &mut reg);
        assert!(out.is_empty());
        assert!(!session.is_closed());
        assert_eq!(session.status(&reg).malformed, 1);

        let frame = SyncMessage::advertise("doc1", ClockVector::new())
            .encode_frame()
            .unwrap();
        session.receive_bytes(&frame, &mut reg);
        assert_eq!(session.state(), SessionState::Synchronized);
    }

    #[test]
    fn test_closed_session_ignores_input() {
        let mut reg = DocumentRegistry::new("A");
        let mut session = SyncSession::new("B", SessionConfig::default());
        session.open(&mut reg);
        session.close();

        let mut other = DocumentRegistry::new("B");
        add(&mut other, "x");
        let changes = other.get("doc1").changes_since(&ClockVector::new());
        let out = session.handle_message(SyncMessage::batch("doc1", other.clock("doc1"), changes), &mut reg);

        assert!(out.is_empty());
        assert!(reg.clock("doc1").is_empty());
        assert_eq!(session.open(&mut reg), Vec::new());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_missing_dependency_reports_stuck() {
        let mut author = DocumentRegistry::new("A");
        add(&mut author, "x");
        add(&mut author, "y");
        let second = author.get("doc1").changes_since(&ClockVector::at("A", 1));

        let mut reg = DocumentRegistry::new("B");
        let config = SessionConfig {
            stuck_after: Duration::ZERO,
            ..SessionConfig::default()
        };
        let mut session = SyncSession::new("A", config);
        session.open(&mut reg);
        session.handle_message(SyncMessage::batch("doc1", ClockVector::at("A", 2), second), &mut reg);

        let status = session.status(&reg);
        assert_eq!(status.state, SessionState::Negotiating);
        assert!(status.stuck);
        assert_eq!(status.missing, vec![("doc1".to_string(), "A".to_string(), 1)]);
    }
}
