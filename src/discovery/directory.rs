//! Cluster service discovery
//!
//! `ServiceDiscovery` is the seam to whatever the cluster uses to announce
//! services. `ServiceDirectory` is the in-process implementation used by
//! the node binary (seeded from configuration) and by tests.

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// One announced instance of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerService {
    pub service_id: String,
    /// Service-specific payload; for the broker this is its address
    pub payload: String,
}

impl PeerService {
    pub fn new(service_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            payload: payload.into(),
        }
    }
}

/// Change notification from discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerAdded(PeerService),
    PeerRemoved(PeerService),
}

impl DiscoveryEvent {
    pub fn service(&self) -> &PeerService {
        match self {
            DiscoveryEvent::PeerAdded(s) | DiscoveryEvent::PeerRemoved(s) => s,
        }
    }
}

/// Source of service announcements
pub trait ServiceDiscovery: Send + Sync {
    /// Currently announced instances of a service
    fn find_peers_of_service(&self, service_id: &str) -> Vec<PeerService>;

    /// Stream of subsequent additions and removals
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

// ─────────────────────────────────────────────────────────────────
// In-process directory
// ─────────────────────────────────────────────────────────────────

const EVENT_CAPACITY: usize = 64;

/// In-process service directory
pub struct ServiceDirectory {
    services: RwLock<Vec<PeerService>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Announce a service instance. Returns false if it was already known.
    pub fn announce(&self, service_id: &str, payload: &str) -> bool {
        let service = PeerService::new(service_id, payload);
        {
            let mut services = self.services.write();
            if services.contains(&service) {
                return false;
            }
            services.push(service.clone());
        }
        info!(service_id, payload, "Service announced");
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(DiscoveryEvent::PeerAdded(service));
        true
    }

    /// Withdraw a service instance. Returns false if it was not known.
    pub fn withdraw(&self, service_id: &str, payload: &str) -> bool {
        let service = PeerService::new(service_id, payload);
        {
            let mut services = self.services.write();
            let before = services.len();
            services.retain(|s| s != &service);
            if services.len() == before {
                return false;
            }
        }
        info!(service_id, payload, "Service withdrawn");
        let _ = self.events.send(DiscoveryEvent::PeerRemoved(service));
        true
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceDiscovery for ServiceDirectory {
    fn find_peers_of_service(&self, service_id: &str) -> Vec<PeerService> {
        let found: Vec<PeerService> = self
            .services
            .read()
            .iter()
            .filter(|s| s.service_id == service_id)
            .cloned()
            .collect();
        debug!(service_id, count = found.len(), "Service lookup");
        found
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}
