//! HTTP routes of the identity service
//!
//! `GET /id` issues a fresh actor id along with the primary (the first id
//! ever issued, `null` on the very first call). `GET /todos` returns seed
//! todos. `POST /peers` and `GET /peers` maintain the peer address directory.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;
use warp::{Filter, Reply};

use super::{Identity, PeerAddress, PeerDirectory, SeedTodos};
use crate::convergent::ActorId;
use crate::todo::Todo;

#[derive(Default)]
pub struct IdentityState {
    primary: Option<ActorId>,
    peers: BTreeMap<ActorId, String>,
}

impl IdentityState {
    /// Issue an id. The first one issued becomes the primary for everyone after.
    pub fn issue(&mut self) -> Identity {
        let id = Uuid::new_v4().to_string();
        let identity = Identity {
            id: id.clone(),
            primary: self.primary.clone(),
        };
        if self.primary.is_none() {
            log::info!("primary is {}", id);
            self.primary = Some(id);
        }
        identity
    }
}

pub type SharedState = Arc<RwLock<IdentityState>>;

pub fn new_state() -> SharedState {
    Arc::new(RwLock::new(IdentityState::default()))
}

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

/// All routes of the service
pub fn routes(state: SharedState) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let id = warp::path("id")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_id);

    let todos = warp::path("todos")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(handle_todos);

    let announce = warp::path("peers")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_announce);

    let peers = warp::path("peers")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_peers);

    id.or(todos).or(announce).or(peers)
}

async fn handle_id(state: SharedState) -> Result<impl Reply, warp::Rejection> {
    let identity = state.write().await.issue();
    log::debug!("issued {} (primary {:?})", identity.id, identity.primary);
    Ok(warp::reply::json(&identity))
}

async fn handle_todos() -> Result<impl Reply, warp::Rejection> {
    let seed = SeedTodos {
        todos: vec![Todo {
            id: Uuid::new_v4().to_string(),
            title: "Take a break".to_string(),
            completed: false,
        }],
    };
    Ok(warp::reply::json(&seed))
}

async fn handle_announce(address: PeerAddress, state: SharedState) -> Result<impl Reply, warp::Rejection> {
    log::info!("peer {} listens on {}", address.id, address.addr);
    state.write().await.peers.insert(address.id, address.addr);
    Ok(warp::reply::json(&serde_json::json!({ "ok": true })))
}

async fn handle_peers(state: SharedState) -> Result<impl Reply, warp::Rejection> {
    let directory = PeerDirectory {
        peers: state
            .read()
            .await
            .peers
            .iter()
            .map(|(id, addr)| PeerAddress {
                id: id.clone(),
                addr: addr.clone(),
            })
            .collect(),
    };
    Ok(warp::reply::json(&directory))
}
