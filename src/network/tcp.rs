//! TCP transport
//!
//! Each link starts with a hello frame carrying the sender's actor id. After
//! that, the reader forwards only whole frames, so two links to the same peer
//! (both sides dialing at once) can coexist without interleaving bytes.
//! Sends go out on the most recently established link.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::transport::{EventReceiver, EventSender, Transport, TransportEvent};
use super::TransportError;
use crate::convergent::ActorId;
use crate::sync::message::{frame, FrameDecoder};

/// Largest hello frame accepted (actor ids are short)
const MAX_HELLO: usize = 1024;

struct Link {
    id: u64,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader: AbortHandle,
}

struct Shared {
    local_id: ActorId,
    max_frame: usize,
    events: EventSender,
    addresses: Mutex<HashMap<ActorId, SocketAddr>>,
    links: Mutex<HashMap<ActorId, Vec<Link>>>,
    next_link: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Start the reader and writer tasks for a handshaken stream.
    fn register(
        self: &Arc<Self>,
        peer: ActorId,
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
        decoder: FrameDecoder,
        inbound: bool,
    ) {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write, rx));

        log::debug!(
            "[{}] link {} to {} up ({})",
            self.local_id,
            id,
            peer,
            if inbound { "inbound" } else { "outbound" }
        );

        // hold the lock until the link is recorded so the reader cannot
        // report it lost first, and announce it before any of its data
        let mut links = lock(&self.links);
        if !links.contains_key(&peer) {
            if inbound {
                self.emit(TransportEvent::IncomingConnection(peer.clone()));
            }
            self.emit(TransportEvent::Open(peer.clone()));
        }
        let reader = tokio::spawn(read_loop(Arc::clone(self), peer.clone(), id, read, decoder));
        links.entry(peer).or_default().push(Link {
            id,
            writer: tx,
            reader: reader.abort_handle(),
        });
    }

    /// A link ended on its own; report `Closed` once the last one is gone.
    fn link_lost(&self, peer: &ActorId, id: u64) {
        let now_empty = {
            let mut links = lock(&self.links);
            match links.get_mut(peer) {
                Some(entry) => {
                    let before = entry.len();
                    entry.retain(|l| l.id != id);
                    let removed = entry.len() != before;
                    let empty = entry.is_empty();
                    if empty {
                        links.remove(peer);
                    }
                    removed && empty
                }
                None => false,
            }
        };
        if now_empty {
            log::info!("[{}] link to {} closed", self.local_id, peer);
            self.emit(TransportEvent::Closed(peer.clone()));
        }
    }

    async fn handshake_outbound(self: Arc<Self>, peer: ActorId, addr: SocketAddr) {
        match self.dial_addr(&peer, addr).await {
            Ok((read, write)) => {
                let decoder = FrameDecoder::new(self.max_frame);
                self.register(peer, read, write, decoder, false)
            }
            Err(e) => {
                // the peer may have dialed us meanwhile; that link stands
                let links = lock(&self.links);
                if links.contains_key(&peer) {
                    log::debug!("[{}] dial to {} at {} failed: {}", self.local_id, peer, addr, e);
                } else {
                    log::warn!("[{}] could not reach {} at {}: {}", self.local_id, peer, addr, e);
                    self.emit(TransportEvent::Closed(peer));
                }
            }
        }
    }

    async fn dial_addr(
        &self,
        peer: &ActorId,
        addr: SocketAddr,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        write.write_all(&frame(self.local_id.as_bytes())).await?;
        log::debug!("[{}] dialed {} at {}", self.local_id, peer, addr);
        Ok((read, write))
    }

    async fn handshake_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (mut read, write) = stream.into_split();
        let mut decoder = FrameDecoder::new(MAX_HELLO);
        match read_hello(&mut read, &mut decoder).await {
            Ok(peer) if peer == self.local_id => {
                log::warn!("[{}] ignoring connection from ourselves at {}", self.local_id, remote);
            }
            Ok(peer) => {
                // bytes after the hello may already be buffered
                decoder.set_max_frame(self.max_frame);
                self.register(peer, read, write, decoder, true);
            }
            Err(e) => log::warn!("[{}] handshake with {} failed: {}", self.local_id, remote, e),
        }
    }
}

async fn read_hello(
    read: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> Result<ActorId, TransportError> {
    let mut buf = [0u8; 256];
    loop {
        match decoder.next_frame() {
            Ok(Some(payload)) => {
                return String::from_utf8(payload.to_vec())
                    .map_err(|e| TransportError::Handshake(e.to_string()));
            }
            Ok(None) => {}
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
        }
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Handshake("closed before hello".into()));
        }
        decoder.extend(&buf[..n]);
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if write.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}

async fn read_loop(
    shared: Arc<Shared>,
    peer: ActorId,
    id: u64,
    mut read: OwnedReadHalf,
    mut decoder: FrameDecoder,
) {
    let mut buf = vec![0u8; 8 * 1024];
    'outer: loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => shared.emit(TransportEvent::Data(peer.clone(), frame(&payload))),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[{}] bad frame from {}: {}", shared.local_id, peer, e);
                }
            }
        }
        match read.read(&mut buf).await {
            Ok(0) => break 'outer,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                log::warn!("[{}] read from {} failed: {}", shared.local_id, peer, e);
                break 'outer;
            }
        }
    }
    shared.link_lost(&peer, id);
}

/// TCP links to peers at known addresses.
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    acceptor: AbortHandle,
}

impl TcpTransport {
    /// Listen on `addr` and start accepting links.
    pub async fn bind(
        local_id: impl Into<ActorId>,
        addr: SocketAddr,
        max_frame: usize,
    ) -> Result<(Arc<Self>, EventReceiver), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local_id: local_id.into(),
            max_frame,
            events,
            addresses: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(0),
        });

        let accepting = Arc::clone(&shared);
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tokio::spawn(Arc::clone(&accepting).handshake_inbound(stream, remote));
                    }
                    Err(e) => log::warn!("[{}] accept failed: {}", accepting.local_id, e),
                }
            }
        });
        log::info!("[{}] listening on {}", shared.local_id, local_addr);

        let transport = Arc::new(Self {
            shared,
            local_addr,
            acceptor: acceptor.abort_handle(),
        });
        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record where a peer can be dialed.
    pub fn add_address(&self, peer: impl Into<ActorId>, addr: SocketAddr) {
        lock(&self.shared.addresses).insert(peer.into(), addr);
    }

    pub fn address_of(&self, peer: &str) -> Option<SocketAddr> {
        lock(&self.shared.addresses).get(peer).copied()
    }
}

impl Transport for TcpTransport {
    fn local_id(&self) -> &ActorId {
        &self.shared.local_id
    }

    fn dial(&self, peer: &ActorId) -> Result<(), TransportError> {
        if lock(&self.shared.links).contains_key(peer) {
            return Ok(());
        }
        let addr = self
            .address_of(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        tokio::spawn(Arc::clone(&self.shared).handshake_outbound(peer.clone(), addr));
        Ok(())
    }

    fn send(&self, peer: &ActorId, data: Vec<u8>) -> Result<(), TransportError> {
        let links = lock(&self.shared.links);
        let link = links
            .get(peer)
            .and_then(|l| l.last())
            .ok_or_else(|| TransportError::Closed(peer.clone()))?;
        link.writer
            .send(data)
            .map_err(|_| TransportError::Closed(peer.clone()))
    }

    fn close(&self, peer: &ActorId) {
        let removed = lock(&self.shared.links).remove(peer);
        for link in removed.into_iter().flatten() {
            // dropping the writer ends the write task, which shuts the socket down
            link.reader.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.acceptor.abort();
        for (_, links) in lock(&self.shared.links).drain() {
            for link in links {
                link.reader.abort();
            }
        }
    }
}
