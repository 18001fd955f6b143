//! Multi-node scenarios over the in-memory bus

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestNode};
use peerlink::coordinator::{CoordinatorEvent, CoordinatorState, LeaveReason};
use peerlink::discovery::BROKER_SERVICE_ID;
use peerlink::protocol::Body;
use peerlink::transport::{BusConnector, MemoryNetwork};
use peerlink::Error;

fn connector(network: &Arc<MemoryNetwork>) -> Arc<dyn BusConnector> {
    Arc::new(network.connector())
}

async fn running(node: &mut TestNode) {
    node.coordinator.start().unwrap();
    node.expect_event(|e| *e == CoordinatorEvent::StateChanged(CoordinatorState::Running))
        .await;
}

/// Two running nodes on broker `one` that know each other
async fn pair(network: &Arc<MemoryNetwork>) -> (TestNode, TestNode) {
    let broker = network.add_broker("one").address();
    let mut a = TestNode::new("a", connector(network), &broker);
    let mut b = TestNode::new("b", connector(network), &broker);

    running(&mut a).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    running(&mut b).await;

    assert!(eventually(|| a.coordinator.has_peer("b") && b.coordinator.has_peer("a")).await);
    (a, b)
}

// ─────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_nodes_discover_each_other() {
    let network = MemoryNetwork::new();
    let (mut a, b) = pair(&network).await;

    let joined = a
        .expect_event(|e| matches!(e, CoordinatorEvent::PeerJoined { server_id, .. } if server_id == "b"))
        .await;
    if let CoordinatorEvent::PeerJoined { start_time, .. } = joined {
        assert_eq!(Some(start_time), b.coordinator.start_time());
    }

    // both registries hold both nodes, ordered by start time
    let ids: Vec<String> = a.coordinator.peers().into_iter().map(|p| p.server_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(eventually(|| b.coordinator.peers().len() == 2).await);
    assert_eq!(b.coordinator.oldest_peer().unwrap().server_id, "a");
    assert_eq!(b.coordinator.newest_peer().unwrap().server_id, "b");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_learns_existing_nodes() {
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network).await;

    let broker = network.broker("one").unwrap().address();
    let mut c = TestNode::new("c", connector(&network), &broker);
    running(&mut c).await;

    assert!(eventually(|| c.coordinator.has_peer("a") && c.coordinator.has_peer("b")).await);
    assert!(eventually(|| a.coordinator.has_peer("c") && b.coordinator.has_peer("c")).await);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_other_plugins_are_invisible() {
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network).await;

    let broker = network.broker("one").unwrap().address();
    let mut other = TestNode::with_plugin("z", "other_plugin", connector(&network), &broker);
    running(&mut other).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!a.coordinator.has_peer("z"));
    assert!(!b.coordinator.has_peer("z"));
    assert!(!other.coordinator.has_peer("a"));

    other.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Messaging
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_addressed_message_reaches_only_its_target() {
    let network = MemoryNetwork::new();
    let (mut a, mut b) = pair(&network).await;

    a.coordinator.send_to("b", Body::from("for b")).await.unwrap();

    let got = b
        .expect_event(|e| matches!(e, CoordinatorEvent::Message { .. }))
        .await;
    assert_eq!(
        got,
        CoordinatorEvent::Message {
            from: "a".to_string(),
            body: Body::Text("for b".to_string()),
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = a.events.try_recv() {
        assert!(!matches!(event, CoordinatorEvent::Message { .. }), "{:?}", event);
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_node() {
    let network = MemoryNetwork::new();
    let (mut a, mut b) = pair(&network).await;

    let payload = Body::Json(serde_json::json!({ "seq": 7 }));
    b.coordinator.broadcast(payload.clone()).await.unwrap();

    for node in [&mut a, &mut b] {
        let got = node
            .expect_event(|e| matches!(e, CoordinatorEvent::Message { .. }))
            .await;
        assert_eq!(
            got,
            CoordinatorEvent::Message {
                from: "b".to_string(),
                body: payload.clone(),
            }
        );
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_send_to_oldest_targets_first_started() {
    let network = MemoryNetwork::new();
    let (mut a, b) = pair(&network).await;

    assert!(b.coordinator.send_to_oldest(Body::from("hi eldest")).await.unwrap());
    let got = a
        .expect_event(|e| matches!(e, CoordinatorEvent::Message { .. }))
        .await;
    assert!(matches!(got, CoordinatorEvent::Message { from, .. } if from == "b"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_send_refused_before_running() {
    let network = MemoryNetwork::new();
    let broker = network.add_broker("one").address();
    let node = TestNode::new("solo", connector(&network), &broker);

    let err = node.coordinator.broadcast(Body::from("early")).await.unwrap_err();
    assert!(matches!(err, Error::NotRunning { .. }));

    node.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Departure and failure
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stopping_removes_node_from_peers() {
    let network = MemoryNetwork::new();
    let (mut a, b) = pair(&network).await;

    b.shutdown().await;

    let left = a
        .expect_event(|e| matches!(e, CoordinatorEvent::PeerLeft { .. }))
        .await;
    assert_eq!(
        left,
        CoordinatorEvent::PeerLeft {
            server_id: "b".to_string(),
            reason: LeaveReason::Departed,
        }
    );
    assert!(!a.coordinator.has_peer("b"));
    assert!(a.coordinator.has_peer("a"));

    a.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_broker_fails_startup() {
    let network = MemoryNetwork::new();
    let mut node = TestNode::new("lonely", connector(&network), "memory://nowhere");

    node.coordinator.start().unwrap();
    node.expect_event(|e| *e == CoordinatorEvent::StateChanged(CoordinatorState::Failed))
        .await;
    assert_eq!(node.coordinator.state(), CoordinatorState::Failed);

    let err = node.coordinator.broadcast(Body::from("x")).await.unwrap_err();
    assert!(matches!(err, Error::NotRunning { .. }));

    node.shutdown().await;
}

#[tokio::test]
async fn test_stopped_coordinator_cannot_restart() {
    let network = MemoryNetwork::new();
    let broker = network.add_broker("one").address();
    let mut node = TestNode::new("once", connector(&network), &broker);
    running(&mut node).await;

    node.coordinator.stop().await;
    assert_eq!(node.coordinator.state(), CoordinatorState::Stopped);
    assert!(matches!(node.coordinator.start(), Err(Error::NotRunning { .. })));

    node.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Heartbeat
// ─────────────────────────────────────────────────────────────────

fn last_contact(node: &TestNode, server_id: &str) -> i64 {
    node.coordinator
        .peers()
        .into_iter()
        .find(|p| p.server_id == server_id)
        .map(|p| p.last_contact)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_ping_refreshes_contact_through_addressed_pongs() {
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network).await;
    let broker = network.broker("one").unwrap().address();
    let mut c = TestNode::new("c", connector(&network), &broker);
    running(&mut c).await;
    assert!(eventually(|| b.coordinator.has_peer("c") && c.coordinator.has_peer("a")).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let b_saw_a = last_contact(&b, "a");
    let b_saw_c = last_contact(&b, "c");
    let a_saw_b = last_contact(&a, "b");
    let c_saw_a = last_contact(&c, "a");

    b.coordinator.set_ping_rate(1).await;
    assert_eq!(b.coordinator.ping_rate(), 1);

    // a and c answer b's ping; b hears both PONGs
    assert!(
        eventually(|| last_contact(&b, "a") > b_saw_a && last_contact(&b, "c") > b_saw_c).await
    );
    assert!(last_contact(&a, "b") > a_saw_b);

    // a's PONG went to b alone
    assert_eq!(last_contact(&c, "a"), c_saw_a);

    b.coordinator.set_ping_rate(0).await;
    assert_eq!(b.coordinator.ping_rate(), 0);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Broker moves
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_broker_move_preserves_topology() {
    let network = MemoryNetwork::new();
    let (mut a, mut b) = pair(&network).await;
    let two = network.add_broker("two");

    for node in [&a, &b] {
        let generation = node.manager.status().borrow().generation;
        node.directory.announce(BROKER_SERVICE_ID, &two.address());
        node.directory.withdraw(BROKER_SERVICE_ID, "memory://one");
        node.manager
            .wait_connected(generation + 1, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            node.location.current_address().map(|a| a.to_string()),
            Some(two.address())
        );
    }

    assert!(two.sessions_opened() >= 2);
    assert!(a.coordinator.has_peer("b"));
    assert!(b.coordinator.has_peer("a"));
    assert_eq!(a.coordinator.state(), CoordinatorState::Running);

    // the old broker is gone entirely; traffic must flow over the new one
    network.remove_broker("one");
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.coordinator.send_to("b", Body::from("after move")).await.unwrap();
    let got = b
        .expect_event(|e| matches!(e, CoordinatorEvent::Message { .. }))
        .await;
    assert!(matches!(got, CoordinatorEvent::Message { body, .. } if body == Body::from("after move")));

    while a.events.try_recv().is_ok() {}
    a.shutdown().await;
    b.shutdown().await;
}
