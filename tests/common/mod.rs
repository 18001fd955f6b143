//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use peerlink::channel::ConnectionManager;
use peerlink::coordinator::{CoordinatorEvent, CoordinatorSettings, PeerCoordinator};
use peerlink::discovery::{BrokerLocationSource, ServiceDirectory, ServiceDiscovery, BROKER_SERVICE_ID};
use peerlink::transport::{BusConnector, FailoverPolicy};

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// Fast reconnect policy so failing tests fail quickly
pub fn quick_policy() -> FailoverPolicy {
    FailoverPolicy {
        initial_reconnect_delay: Duration::from_millis(10),
        startup_max_reconnect_attempts: 2,
        max_reconnect_attempts: 2,
    }
}

/// One coordinator node with its own discovery view of the bus
pub struct TestNode {
    pub directory: Arc<ServiceDirectory>,
    pub location: Arc<BrokerLocationSource>,
    pub manager: Arc<ConnectionManager>,
    pub coordinator: PeerCoordinator,
    pub events: mpsc::Receiver<CoordinatorEvent>,
}

impl TestNode {
    pub fn new(server_id: &str, connector: Arc<dyn BusConnector>, broker: &str) -> Self {
        Self::with_plugin(server_id, "acme_sync", connector, broker)
    }

    pub fn with_plugin(
        server_id: &str,
        plugin_id: &str,
        connector: Arc<dyn BusConnector>,
        broker: &str,
    ) -> Self {
        let directory = Arc::new(ServiceDirectory::new());
        let location = BrokerLocationSource::new(BROKER_SERVICE_ID);
        location.attach(directory.clone() as Arc<dyn ServiceDiscovery>);
        directory.announce(BROKER_SERVICE_ID, broker);

        let manager = Arc::new(ConnectionManager::new(connector, location.clone(), quick_policy()));
        let (tx, events) = mpsc::channel(256);
        let settings = CoordinatorSettings::new(server_id, plugin_id)
            .with_settle_delay(Duration::from_millis(20));
        let coordinator = PeerCoordinator::new(settings, manager.clone(), tx);

        Self {
            directory,
            location,
            manager,
            coordinator,
            events,
        }
    }

    /// Wait for the first event matching `pred`, skipping others
    pub async fn expect_event<F>(&mut self, pred: F) -> CoordinatorEvent
    where
        F: Fn(&CoordinatorEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for coordinator event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn shutdown(self) {
        self.coordinator.stop().await;
        self.manager.release().await;
        self.location.detach();
    }
}

/// Poll `check` until it holds or ten seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
