//! End-to-end over the WebSocket relay

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestNode};
use peerlink::coordinator::{CoordinatorEvent, CoordinatorState, LeaveReason};
use peerlink::protocol::{Body, Destination, Envelope};
use peerlink::transport::{BusConnector, BusRelay, FailoverPolicy, FailoverUri, WsConnector};

async fn spawn_relay() -> String {
    let relay = BusRelay::bind("127.0.0.1:0").await.unwrap();
    let url = relay.url().unwrap();
    relay.spawn();
    url
}

fn ws() -> Arc<dyn BusConnector> {
    Arc::new(WsConnector::new(Duration::from_secs(2)))
}

#[tokio::test]
async fn test_nodes_coordinate_through_relay() {
    let url = spawn_relay().await;
    let mut a = TestNode::new("ws-a", ws(), &url);
    let mut b = TestNode::new("ws-b", ws(), &url);

    a.coordinator.start().unwrap();
    a.expect_event(|e| *e == CoordinatorEvent::StateChanged(CoordinatorState::Running))
        .await;
    b.coordinator.start().unwrap();
    b.expect_event(|e| *e == CoordinatorEvent::StateChanged(CoordinatorState::Running))
        .await;

    assert!(eventually(|| a.coordinator.has_peer("ws-b") && b.coordinator.has_peer("ws-a")).await);

    a.coordinator
        .send_to("ws-b", Body::Binary(vec![0, 1, 2, 255]))
        .await
        .unwrap();
    let got = b
        .expect_event(|e| matches!(e, CoordinatorEvent::Message { .. }))
        .await;
    assert_eq!(
        got,
        CoordinatorEvent::Message {
            from: "ws-a".to_string(),
            body: Body::Binary(vec![0, 1, 2, 255]),
        }
    );

    b.shutdown().await;
    let left = a
        .expect_event(|e| matches!(e, CoordinatorEvent::PeerLeft { .. }))
        .await;
    assert_eq!(
        left,
        CoordinatorEvent::PeerLeft {
            server_id: "ws-b".to_string(),
            reason: LeaveReason::Departed,
        }
    );

    a.shutdown().await;
}

#[tokio::test]
async fn test_failover_list_skips_dead_relay() {
    let url = spawn_relay().await;

    // Bind then drop to get a port nothing listens on
    let dead = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("ws://{}", probe.local_addr().unwrap())
    };

    let policy = FailoverPolicy {
        initial_reconnect_delay: Duration::from_millis(10),
        startup_max_reconnect_attempts: 1,
        max_reconnect_attempts: 1,
    };
    let uri = FailoverUri::from_address(&format!("failover:({},{})", dead, url), &policy).unwrap();
    let session = ws().connect(&uri).await.unwrap();
    assert!(session.is_open());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let topic = Destination::topic("peerlink_probe");
    session.subscribe(&topic, None, tx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut envelope = Envelope::user("*", "probe", "probe_plugin", Body::from("ping"));
    envelope.set("extra", "1");
    session.publish(&topic, envelope.clone()).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, envelope);

    session.close().await.unwrap();
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_unreachable_relay_reports_connection_error() {
    let dead = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("ws://{}", probe.local_addr().unwrap())
    };
    let policy = FailoverPolicy {
        initial_reconnect_delay: Duration::from_millis(10),
        startup_max_reconnect_attempts: 1,
        max_reconnect_attempts: 1,
    };
    let uri = FailoverUri::from_address(&dead, &policy).unwrap();

    let err = ws().connect(&uri).await.err().unwrap();
    assert!(err.is_retryable(), "{:?}", err);
}
