//! Replicas syncing over the simulated network
//!
//! Each replica runs on its own task behind a `ReplicaHandle`; the tests
//! only talk to them through handles, the way the peer binary does.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use peerdoc::convergent::ClockVector;
use peerdoc::network::{ConnectOutcome, SimNetwork};
use peerdoc::sync::SessionState;
use peerdoc::todo::{self, Todo, TODO_DOC};
use peerdoc::{Replica, ReplicaConfig, ReplicaHandle};

use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn start(network: &Arc<SimNetwork>, id: &str) -> ReplicaHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    let (transport, events) = network.join(id);
    let replica = Replica::new(transport, &ReplicaConfig::default());
    let (handle, _task) = ReplicaHandle::spawn(replica, events);
    handle
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn clock(handle: &ReplicaHandle) -> ClockVector {
    handle.snapshot(TODO_DOC).await.unwrap().clock().clone()
}

async fn list(handle: &ReplicaHandle) -> Vec<Todo> {
    todo::todos(handle.snapshot(TODO_DOC).await.unwrap().state())
}

async fn peer_count(handle: &ReplicaHandle) -> usize {
    handle.status().await.unwrap().peers.len()
}

async fn add(handle: &ReplicaHandle, title: &str) {
    let title = title.to_string();
    handle
        .propose(TODO_DOC, move |tx| {
            todo::add_todo(tx, &title);
        })
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_joining_peer_receives_existing_todos() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let b = start(&network, "B");
    add(&a, "x").await;

    b.connect(&"A".into()).await.unwrap();
    eventually("B to learn A's change", || async { clock(&b).await.get("A") == 1 }).await;

    let todos = list(&b).await;
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].title, "x");
    assert!(!todos[0].completed);

    let status = a.status().await.unwrap();
    assert_eq!(status.peers[0].peer, "B");
    eventually("both sessions to settle", || async {
        let a_state = a.status().await.unwrap().peers[0].state;
        let b_state = b.status().await.unwrap().peers[0].state;
        a_state == SessionState::Synchronized && b_state == SessionState::Synchronized
    })
    .await;
}

#[tokio::test]
async fn test_offline_edits_merge_after_reconnect() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let b = start(&network, "B");
    add(&a, "x").await;
    b.connect(&"A".into()).await.unwrap();
    eventually("initial sync", || async { clock(&b).await.get("A") == 1 }).await;

    assert!(b.disconnect(&"A".into()).await.unwrap());
    eventually("A to notice", || async { peer_count(&a).await == 0 }).await;

    let id = list(&a).await[0].id.clone();
    let toggled = id.clone();
    a.propose(TODO_DOC, move |tx| {
        todo::toggle(tx, &toggled);
    })
    .await
    .unwrap();
    b.propose(TODO_DOC, move |tx| {
        todo::edit(tx, &id, "y");
    })
    .await
    .unwrap();

    a.connect(&"B".into()).await.unwrap();
    eventually("clocks to meet", || async {
        let (ca, cb) = (clock(&a).await, clock(&b).await);
        ca == cb && ca.get("A") == 2 && ca.get("B") == 1
    })
    .await;

    let merged = list(&a).await;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].title, "y");
    assert!(merged[0].completed);
    assert_eq!(list(&b).await, merged);
}

#[tokio::test]
async fn test_connect_twice_keeps_one_record() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let _p2 = start(&network, "p2");

    assert_eq!(a.connect(&"p2".into()).await.unwrap(), ConnectOutcome::Dialing);
    assert_eq!(
        a.connect(&"p2".into()).await.unwrap(),
        ConnectOutcome::AlreadyConnected
    );
    assert_eq!(peer_count(&a).await, 1);
    assert_eq!(network.link_count(), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_both_sides() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let b = start(&network, "B");
    a.connect(&"B".into()).await.unwrap();
    eventually("B to accept", || async { peer_count(&b).await == 1 }).await;

    assert!(a.disconnect(&"B".into()).await.unwrap());
    assert!(!a.disconnect(&"B".into()).await.unwrap());
    assert_eq!(peer_count(&a).await, 0);
    eventually("B to drop the record", || async { peer_count(&b).await == 0 }).await;
    assert_eq!(network.link_count(), 0);
}

#[tokio::test]
async fn test_immediate_reconnect_keeps_the_new_session() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let b = start(&network, "B");
    a.connect(&"B".into()).await.unwrap();
    eventually("B to accept", || async { peer_count(&b).await == 1 }).await;

    assert!(a.disconnect(&"B".into()).await.unwrap());
    assert_eq!(a.connect(&"B".into()).await.unwrap(), ConnectOutcome::Dialing);

    add(&a, "after reconnect").await;
    eventually("edit to arrive", || async { clock(&b).await.get("A") == 1 }).await;
    assert_eq!(peer_count(&a).await, 1);
    assert_eq!(peer_count(&b).await, 1);
    assert!(network.is_linked(&"A".into(), &"B".into()));
}

#[tokio::test]
async fn test_sync_survives_chunked_delivery() {
    let network = SimNetwork::new();
    network.set_chunk_size(Some(3));
    let a = start(&network, "A");
    let b = start(&network, "B");
    for title in ["one", "two", "three"] {
        add(&a, title).await;
    }
    add(&b, "four").await;

    a.connect(&"B".into()).await.unwrap();
    eventually("clocks to meet", || async {
        let (ca, cb) = (clock(&a).await, clock(&b).await);
        ca == cb && ca.get("A") == 3 && ca.get("B") == 1
    })
    .await;
    assert_eq!(list(&a).await, list(&b).await);
    assert_eq!(list(&a).await.len(), 4);
}

#[tokio::test]
async fn test_edits_reach_peers_through_a_hub() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let hub = start(&network, "H");
    let c = start(&network, "C");
    a.connect(&"H".into()).await.unwrap();
    c.connect(&"H".into()).await.unwrap();
    eventually("hub to hold both", || async { peer_count(&hub).await == 2 }).await;

    let (tx, mut notified) = mpsc::unbounded_channel();
    c.subscribe(move |doc| {
        let _ = tx.send(doc.clone());
    })
    .await
    .unwrap();

    add(&a, "relayed").await;
    let doc = tokio::time::timeout(Duration::from_secs(2), notified.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc, TODO_DOC);
    assert_eq!(list(&c).await[0].title, "relayed");
    assert!(!network.is_linked(&"A".into(), &"C".into()));
}

#[tokio::test]
async fn test_peer_leaving_is_reported_as_closed() {
    let network = SimNetwork::new();
    let a = start(&network, "A");
    let b = start(&network, "B");
    a.set_primary("B".into()).unwrap();
    a.connect(&"B".into()).await.unwrap();
    eventually("link up", || async { peer_count(&b).await == 1 }).await;

    network.leave(&"B".into());
    eventually("A to drop B", || async { peer_count(&a).await == 0 }).await;

    // still usable locally
    add(&a, "offline").await;
    assert_eq!(clock(&a).await.get("A"), 1);
    assert_eq!(a.status().await.unwrap().primary.as_deref(), Some("B"));
}
