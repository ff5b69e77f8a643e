//! Replica: one peer's documents and connections
//!
//! [`Replica`] is the explicit context that owns a `DocumentRegistry` and a
//! `PeerManager`; several can live in one process. [`ReplicaHandle`] moves a
//! replica onto its own tokio task, which processes commands and transport
//! events one at a time in arrival order. That task is the only code that
//! ever touches the replica's state.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ReplicaConfig;
use crate::convergent::{
    ActorId, Change, ChangeBuilder, ClockVector, DeliveryError, Document, DocumentId,
    DocumentRegistry, RegistryError, Seq, SubscriptionId,
};
use crate::network::{
    ConnectOutcome, EventReceiver, PeerManager, Transport, TransportError, TransportEvent,
};
use crate::sync::SessionStatus;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Replica task has stopped")]
    Stopped,
}

/// Diagnostics for one document
#[derive(Clone, Debug, Serialize)]
pub struct DocumentStatus {
    pub id: DocumentId,
    pub clock: ClockVector,
    pub pending: usize,
    pub missing: Vec<(ActorId, Seq)>,
    pub discarded: Vec<String>,
}

/// Diagnostics for a whole replica
#[derive(Clone, Debug, Serialize)]
pub struct ReplicaStatus {
    pub actor: ActorId,
    pub primary: Option<ActorId>,
    pub documents: Vec<DocumentStatus>,
    pub peers: Vec<SessionStatus>,
}

pub struct Replica {
    registry: DocumentRegistry,
    peers: PeerManager,
}

impl Replica {
    /// Build a replica whose actor id is the transport's local id.
    pub fn new(transport: Arc<dyn Transport>, config: &ReplicaConfig) -> Self {
        let actor = transport.local_id().clone();
        Self {
            registry: DocumentRegistry::with_max_pending(actor, config.max_pending_per_document),
            peers: PeerManager::new(transport, config.session_config()),
        }
    }

    pub fn actor(&self) -> &ActorId {
        self.registry.actor()
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn document(&mut self, id: &str) -> &Document {
        self.registry.get(id)
    }

    /// Author a local change and push it to every connected peer.
    pub fn propose<F>(&mut self, id: &str, mutator: F) -> Result<Change, RegistryError>
    where
        F: FnOnce(&mut ChangeBuilder<'_>),
    {
        let change = self.registry.propose(id, mutator)?;
        self.peers.on_document_changed(id, &mut self.registry, None);
        Ok(change)
    }

    pub fn connect(&mut self, peer: &ActorId) -> Result<ConnectOutcome, TransportError> {
        self.peers.connect(peer)
    }

    pub fn disconnect(&mut self, peer: &ActorId) -> bool {
        self.peers.disconnect(peer, &mut self.registry)
    }

    pub fn set_primary(&mut self, peer: ActorId) {
        self.peers.set_primary(peer);
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        self.peers.handle_event(event, &mut self.registry);
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&DocumentId) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        self.registry.unsubscribe(subscription)
    }

    pub fn status(&self) -> ReplicaStatus {
        let documents = self
            .registry
            .document_ids()
            .into_iter()
            .map(|id| DocumentStatus {
                clock: self.registry.clock(&id),
                pending: self.registry.pending_count(&id),
                missing: self.registry.missing_dependencies(&id),
                discarded: self
                    .registry
                    .discarded(&id)
                    .iter()
                    .map(DeliveryError::to_string)
                    .collect(),
                id,
            })
            .collect();
        ReplicaStatus {
            actor: self.actor().clone(),
            primary: self.peers.primary().cloned(),
            documents,
            peers: self.peers.status(&self.registry),
        }
    }
}

type Mutator = Box<dyn FnOnce(&mut ChangeBuilder<'_>) + Send>;
type Callback = Box<dyn Fn(&DocumentId) + Send + Sync>;

enum Command {
    Propose {
        doc: DocumentId,
        mutator: Mutator,
        reply: oneshot::Sender<Result<Change, RegistryError>>,
    },
    Connect {
        peer: ActorId,
        reply: oneshot::Sender<Result<ConnectOutcome, TransportError>>,
    },
    Disconnect {
        peer: ActorId,
        reply: oneshot::Sender<bool>,
    },
    SetPrimary {
        peer: ActorId,
    },
    Snapshot {
        doc: DocumentId,
        reply: oneshot::Sender<Document>,
    },
    Status {
        reply: oneshot::Sender<ReplicaStatus>,
    },
    Subscribe {
        callback: Callback,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Shutdown,
}

impl Replica {
    fn execute(&mut self, command: Command) {
        match command {
            Command::Propose { doc, mutator, reply } => {
                let _ = reply.send(self.propose(&doc, mutator));
            }
            Command::Connect { peer, reply } => {
                let _ = reply.send(self.connect(&peer));
            }
            Command::Disconnect { peer, reply } => {
                let _ = reply.send(self.disconnect(&peer));
            }
            Command::SetPrimary { peer } => self.set_primary(peer),
            Command::Snapshot { doc, reply } => {
                let _ = reply.send(self.document(&doc).clone());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Subscribe { callback, reply } => {
                let _ = reply.send(self.subscribe(callback));
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle to a replica running on its own task.
#[derive(Clone)]
pub struct ReplicaHandle {
    actor: ActorId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ReplicaHandle {
    /// Move the replica onto a task that also drains `events`.
    ///
    /// The task ends on `shutdown` (or when every handle is dropped) and
    /// hands the replica back through the join handle.
    pub fn spawn(mut replica: Replica, mut events: EventReceiver) -> (Self, JoinHandle<Replica>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Self {
            actor: replica.actor().clone(),
            commands: tx,
        };

        let task = tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => replica.execute(command),
                    },
                    event = events.recv(), if events_open => match event {
                        Some(event) => replica.handle_event(event),
                        None => events_open = false,
                    },
                }
            }
            log::debug!("[{}] replica task stopped", replica.actor());
            replica
        });
        (handle, task)
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ReplicaError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ReplicaError::Stopped)?;
        response.await.map_err(|_| ReplicaError::Stopped)
    }

    pub async fn propose<F>(&self, doc: &str, mutator: F) -> Result<Change, ReplicaError>
    where
        F: FnOnce(&mut ChangeBuilder<'_>) + Send + 'static,
    {
        let doc = doc.to_string();
        let mutator: Mutator = Box::new(mutator);
        Ok(self
            .request(|reply| Command::Propose { doc, mutator, reply })
            .await??)
    }

    pub async fn connect(&self, peer: &ActorId) -> Result<ConnectOutcome, ReplicaError> {
        let peer = peer.clone();
        Ok(self.request(|reply| Command::Connect { peer, reply }).await??)
    }

    pub async fn disconnect(&self, peer: &ActorId) -> Result<bool, ReplicaError> {
        let peer = peer.clone();
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    pub fn set_primary(&self, peer: ActorId) -> Result<(), ReplicaError> {
        self.commands
            .send(Command::SetPrimary { peer })
            .map_err(|_| ReplicaError::Stopped)
    }

    /// Copy of a document as it stands now
    pub async fn snapshot(&self, doc: &str) -> Result<Document, ReplicaError> {
        let doc = doc.to_string();
        self.request(|reply| Command::Snapshot { doc, reply }).await
    }

    pub async fn status(&self) -> Result<ReplicaStatus, ReplicaError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Register a change callback. It runs on the replica task.
    pub async fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId, ReplicaError>
    where
        F: Fn(&DocumentId) + Send + Sync + 'static,
    {
        let callback: Callback = Box::new(callback);
        self.request(|reply| Command::Subscribe { callback, reply })
            .await
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
