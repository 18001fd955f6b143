//! Broker location tracking
//!
//! `BrokerLocationSource` watches discovery for the broker service and tells
//! its observers whenever the broker address appears, changes, or goes away.
//! A process builds exactly one and shares it by `Arc`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::directory::{DiscoveryEvent, ServiceDiscovery};

/// Service id under which brokers announce themselves
pub const BROKER_SERVICE_ID: &str = "message_broker";

/// Opaque broker connection string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress(String);

impl BrokerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for BrokerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Receives broker address changes. `None` means no broker is known.
///
/// Observers are called from the discovery task and from `subscribe`;
/// they must return quickly and must not call back into the source.
pub trait AddressObserver: Send + Sync {
    fn address_changed(&self, address: Option<BrokerAddress>);
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct LocationState {
    current: Option<BrokerAddress>,
    /// Announced broker instances, oldest first
    known: Vec<String>,
}

pub struct BrokerLocationSource {
    service_id: String,
    state: Mutex<LocationState>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn AddressObserver>)>>,
    /// Serializes deliveries so observers see changes in order
    delivery: Mutex<()>,
    next_id: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerLocationSource {
    pub fn new(service_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            service_id: service_id.into(),
            state: Mutex::new(LocationState::default()),
            observers: Mutex::new(Vec::new()),
            delivery: Mutex::new(()),
            next_id: AtomicU64::new(1),
            pump: Mutex::new(None),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn current_address(&self) -> Option<BrokerAddress> {
        self.state.lock().current.clone()
    }

    /// Start following a discovery source: look up the broker now, then
    /// track additions and removals on a background task.
    pub fn attach(self: &Arc<Self>, discovery: Arc<dyn ServiceDiscovery>) {
        // Subscribe before the lookup so nothing announced in between is missed
        let mut events = discovery.subscribe();
        self.resync(discovery.as_ref());

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(source) = weak.upgrade() else { break };
                        source.handle_event(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let Some(source) = weak.upgrade() else { break };
                        warn!(skipped, "Discovery events lagged, resynchronizing");
                        source.resync(discovery.as_ref());
                    }
                    Err(RecvError::Closed) => {
                        debug!("Discovery event stream closed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop following discovery
    pub fn detach(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    /// Apply one discovery event
    pub fn handle_event(&self, event: &DiscoveryEvent) {
        let service = event.service();
        if service.service_id != self.service_id {
            return;
        }

        // Held across compute and notify so observers see changes in order
        let _order = self.delivery.lock();
        let changed = {
            let mut state = self.state.lock();
            match event {
                DiscoveryEvent::PeerAdded(s) => {
                    if !state.known.contains(&s.payload) {
                        state.known.push(s.payload.clone());
                    }
                    if state.current.is_none() {
                        state.current = Some(BrokerAddress::new(s.payload.clone()));
                        Some(state.current.clone())
                    } else {
                        None
                    }
                }
                DiscoveryEvent::PeerRemoved(s) => {
                    state.known.retain(|p| p != &s.payload);
                    let is_current = state
                        .current
                        .as_ref()
                        .map(|c| c.as_str() == s.payload)
                        .unwrap_or(false);
                    if is_current {
                        state.current = state.known.first().cloned().map(BrokerAddress::new);
                        Some(state.current.clone())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(address) = changed {
            match &address {
                Some(a) => info!(address = %a, "Broker address changed"),
                None => warn!("Broker went away, no address known"),
            }
            self.deliver(address);
        }
    }

    fn resync(&self, discovery: &dyn ServiceDiscovery) {
        let announced: Vec<String> = discovery
            .find_peers_of_service(&self.service_id)
            .into_iter()
            .map(|s| s.payload)
            .collect();

        let _order = self.delivery.lock();
        let changed = {
            let mut state = self.state.lock();
            state.known = announced;
            let still_valid = state
                .current
                .as_ref()
                .map(|c| state.known.iter().any(|p| p == c.as_str()))
                .unwrap_or(false);
            if still_valid {
                None
            } else {
                let next = state.known.first().cloned().map(BrokerAddress::new);
                if next == state.current {
                    None
                } else {
                    state.current = next;
                    Some(state.current.clone())
                }
            }
        };

        if let Some(address) = changed {
            info!(
                address = address.as_ref().map(|a| a.as_str()).unwrap_or("<none>"),
                "Broker address resolved"
            );
            self.deliver(address);
        }
    }

    /// Register an observer. It is immediately told the current address.
    pub fn subscribe(&self, observer: Arc<dyn AddressObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _order = self.delivery.lock();
        self.observers.lock().push((id, observer.clone()));
        let current = self.current_address();
        observer.address_changed(current);
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Caller holds `delivery`
    fn deliver(&self, address: Option<BrokerAddress>) {
        let snapshot: Vec<Arc<dyn AddressObserver>> =
            self.observers.lock().iter().map(|(_, o)| o.clone()).collect();
        for observer in snapshot {
            observer.address_changed(address.clone());
        }
    }
}

impl Drop for BrokerLocationSource {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
    }
}
