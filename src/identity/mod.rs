//! Identity service
//!
//! A replica learns its actor id (and the rendezvous primary) from a small
//! HTTP service, which also hands out seed todos for a brand-new list and
//! keeps a directory of peer listen addresses. [`IdentityService`] is the
//! seam: [`HttpIdentityClient`] talks to the real service, [`StaticIdentity`]
//! answers from memory for tests and offline use.

pub mod server;

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convergent::ActorId;
use crate::todo::Todo;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {0}")]
    Status(u16),
}

/// Response of `GET /id`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ActorId,
    /// First actor ever issued; `None` when we are that actor
    pub primary: Option<ActorId>,
}

/// Response of `GET /todos`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedTodos {
    pub todos: Vec<Todo>,
}

/// Where a peer listens for links
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: ActorId,
    pub addr: String,
}

/// Response of `GET /peers`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDirectory {
    pub peers: Vec<PeerAddress>,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Obtain a fresh actor id and the primary
    async fn identify(&self) -> Result<Identity, IdentityError>;

    /// Todos to seed a new list with
    async fn seed_todos(&self) -> Result<Vec<Todo>, IdentityError>;

    /// Publish our listen address
    async fn announce(&self, address: &PeerAddress) -> Result<(), IdentityError>;

    /// Every known peer address
    async fn peers(&self) -> Result<Vec<PeerAddress>, IdentityError>;
}

/// Client for the HTTP identity service.
pub struct HttpIdentityClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIdentityClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, IdentityError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            log::warn!("GET {} failed: {}", url, resp.status());
            return Err(IdentityError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl IdentityService for HttpIdentityClient {
    async fn identify(&self) -> Result<Identity, IdentityError> {
        self.get_json("/id").await
    }

    async fn seed_todos(&self) -> Result<Vec<Todo>, IdentityError> {
        let seed: SeedTodos = self.get_json("/todos").await?;
        Ok(seed.todos)
    }

    async fn announce(&self, address: &PeerAddress) -> Result<(), IdentityError> {
        let url = format!("{}/peers", self.base_url);
        let resp = self.client.post(&url).json(address).send().await?;
        if !resp.status().is_success() {
            log::warn!("POST {} failed: {}", url, resp.status());
            return Err(IdentityError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn peers(&self) -> Result<Vec<PeerAddress>, IdentityError> {
        let directory: PeerDirectory = self.get_json("/peers").await?;
        Ok(directory.peers)
    }
}

/// In-memory identity service.
pub struct StaticIdentity {
    identity: Identity,
    seed: Vec<Todo>,
    peers: Mutex<Vec<PeerAddress>>,
}

impl StaticIdentity {
    pub fn new(identity: Identity, seed: Vec<Todo>) -> Self {
        Self {
            identity,
            seed,
            peers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl IdentityService for StaticIdentity {
    async fn identify(&self) -> Result<Identity, IdentityError> {
        Ok(self.identity.clone())
    }

    async fn seed_todos(&self) -> Result<Vec<Todo>, IdentityError> {
        Ok(self.seed.clone())
    }

    async fn announce(&self, address: &PeerAddress) -> Result<(), IdentityError> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.retain(|p| p.id != address.id);
        peers.push(address.clone());
        Ok(())
    }

    async fn peers(&self) -> Result<Vec<PeerAddress>, IdentityError> {
        Ok(self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
