//! In-process bus
//!
//! Brokers live in a `MemoryNetwork` keyed by name and are addressed as
//! `memory://<name>`. Taking a broker down drops every consumer attached to
//! it, which is how tests simulate a broker failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::protocol::{AddressFilter, Destination, DestinationKind, Envelope};

use super::failover::{connect_with_retry, FailoverUri};
use super::{BusConnector, BusSession, ConsumerId, EnvelopeSink};

pub const MEMORY_SCHEME: &str = "memory://";

struct Subscription {
    session: u64,
    consumer: ConsumerId,
    destination: Destination,
    selector: Option<AddressFilter>,
    sink: EnvelopeSink,
}

impl Subscription {
    fn accepts(&self, destination: &Destination, envelope: &Envelope) -> bool {
        self.destination == *destination
            && self.selector.as_ref().map(|s| s.matches(envelope)).unwrap_or(true)
    }
}

/// One in-process broker
pub struct MemoryBroker {
    name: String,
    up: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    next_session: AtomicU64,
    published: AtomicU64,
    sessions_opened: AtomicU64,
}

impl MemoryBroker {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            up: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
            published: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> String {
        format!("{}{}", MEMORY_SCHEME, self.name)
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Messages accepted since the broker was created
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Take the broker down, dropping every consumer
    pub fn shutdown(&self) {
        self.up.store(false, Ordering::SeqCst);
        let dropped = std::mem::take(&mut *self.subscriptions.lock());
        info!(broker = %self.name, consumers = dropped.len(), "Memory broker down");
    }

    fn open_session(&self) -> u64 {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    fn publish(&self, destination: &Destination, envelope: Envelope) -> Result<()> {
        if !self.is_up() {
            return Err(Error::ConnectionLost {
                message: format!("broker {} is down", self.name),
            });
        }
        self.published.fetch_add(1, Ordering::SeqCst);

        let subscriptions = self.subscriptions.lock();
        let mut matching = subscriptions
            .iter()
            .filter(|s| s.accepts(destination, &envelope));

        match destination.kind {
            DestinationKind::Topic => {
                for sub in matching {
                    // A closed sink is a consumer going away; skip it
                    let _ = sub.sink.send(envelope.clone());
                }
            }
            DestinationKind::Queue => {
                if let Some(sub) = matching.find(|s| !s.sink.is_closed()) {
                    let _ = sub.sink.send(envelope);
                }
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        session: u64,
        consumer: ConsumerId,
        destination: &Destination,
        selector: Option<AddressFilter>,
        sink: EnvelopeSink,
    ) -> Result<()> {
        if !self.is_up() {
            return Err(Error::ConnectionLost {
                message: format!("broker {} is down", self.name),
            });
        }
        self.subscriptions.lock().push(Subscription {
            session,
            consumer,
            destination: destination.clone(),
            selector,
            sink,
        });
        Ok(())
    }

    fn unsubscribe(&self, session: u64, consumer: ConsumerId) {
        self.subscriptions
            .lock()
            .retain(|s| !(s.session == session && s.consumer == consumer));
    }

    fn close_session(&self, session: u64) {
        self.subscriptions.lock().retain(|s| s.session != session);
    }
}

// ─────────────────────────────────────────────────────────────────
// Network and connector
// ─────────────────────────────────────────────────────────────────

/// Set of named in-process brokers
#[derive(Default)]
pub struct MemoryNetwork {
    brokers: RwLock<HashMap<String, Arc<MemoryBroker>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a broker, replacing any previous broker of the same name
    pub fn add_broker(&self, name: &str) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new(name));
        if let Some(old) = self.brokers.write().insert(name.to_string(), broker.clone()) {
            old.shutdown();
        }
        debug!(broker = name, "Memory broker started");
        broker
    }

    /// Shut a broker down and forget it
    pub fn remove_broker(&self, name: &str) -> bool {
        match self.brokers.write().remove(name) {
            Some(broker) => {
                broker.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn broker(&self, name: &str) -> Option<Arc<MemoryBroker>> {
        self.brokers.read().get(name).cloned()
    }

    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    fn resolve(&self, url: &str) -> Result<Arc<MemoryBroker>> {
        let name = url
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| Error::connection_failed(url, "not a memory:// address"))?;
        match self.broker(name) {
            Some(broker) if broker.is_up() => Ok(broker),
            _ => Err(Error::connection_failed(url, "no such broker")),
        }
    }
}

/// Connector for `memory://` addresses
#[derive(Clone)]
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self, uri: &FailoverUri) -> Result<Arc<dyn BusSession>> {
        let network = self.network.clone();
        let broker = connect_with_retry(uri, uri.policy.startup_max_reconnect_attempts, |url| {
            let network = network.clone();
            async move { network.resolve(&url) }
        })
        .await?;

        let session_id = broker.open_session();
        debug!(broker = %broker.name, session = session_id, "Memory session opened");
        Ok(Arc::new(MemorySession {
            broker,
            session_id,
            open: AtomicBool::new(true),
            next_consumer: AtomicU64::new(1),
        }))
    }
}

struct MemorySession {
    broker: Arc<MemoryBroker>,
    session_id: u64,
    open: AtomicBool,
    next_consumer: AtomicU64,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl BusSession for MemorySession {
    async fn publish(&self, destination: &Destination, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        trace!(destination = %destination.name, "Memory publish");
        self.broker.publish(destination, envelope)
    }

    async fn subscribe(
        &self,
        destination: &Destination,
        selector: Option<AddressFilter>,
        sink: EnvelopeSink,
    ) -> Result<ConsumerId> {
        self.ensure_open()?;
        let consumer = self.next_consumer.fetch_add(1, Ordering::SeqCst);
        self.broker
            .subscribe(self.session_id, consumer, destination, selector, sink)?;
        Ok(consumer)
    }

    async fn unsubscribe(&self, consumer: ConsumerId) -> Result<()> {
        self.broker.unsubscribe(self.session_id, consumer);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_session(self.session_id);
            debug!(broker = %self.broker.name, session = self.session_id, "Memory session closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.is_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;
    use tokio::sync::mpsc;

    fn uri(address: &str) -> FailoverUri {
        FailoverUri::parse(&format!("failover:({})?startupMaxReconnectAttempts=0", address)).unwrap()
    }

    #[tokio::test]
    async fn test_topic_fans_out_with_selector() {
        let network = MemoryNetwork::new();
        let broker = network.add_broker("main");
        let session = network.connector().connect(&uri(&broker.address())).await.unwrap();

        let topic = Destination::topic("peerlink_acme_sync");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        session
            .subscribe(&topic, Some(AddressFilter::new("acme_sync", "a")), tx_a)
            .await
            .unwrap();
        session
            .subscribe(&topic, Some(AddressFilter::new("acme_sync", "b")), tx_b)
            .await
            .unwrap();

        session
            .publish(&topic, Envelope::user("*", "c", "acme_sync", Body::from("all")))
            .await
            .unwrap();
        session
            .publish(&topic, Envelope::user("b", "c", "acme_sync", Body::from("only b")))
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await.unwrap().body.as_text(), Some("all"));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.recv().await.unwrap().body.as_text(), Some("all"));
        assert_eq!(rx_b.recv().await.unwrap().body.as_text(), Some("only b"));
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_queue_delivers_once() {
        let network = MemoryNetwork::new();
        let broker = network.add_broker("main");
        let session = network.connector().connect(&uri(&broker.address())).await.unwrap();

        let queue = Destination::queue("jobs");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        session.subscribe(&queue, None, tx_a).await.unwrap();
        session.subscribe(&queue, None, tx_b).await.unwrap();

        session
            .publish(&queue, Envelope::user("*", "c", "p", Body::Empty))
            .await
            .unwrap();

        let got = rx_a.try_recv().is_ok() as u8 + rx_b.try_recv().is_ok() as u8;
        assert_eq!(got, 1);
    }

    #[tokio::test]
    async fn test_unknown_broker_fails() {
        let network = MemoryNetwork::new();
        let result = network.connector().connect(&uri("memory://nowhere")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drops_consumers() {
        let network = MemoryNetwork::new();
        let broker = network.add_broker("main");
        let session = network.connector().connect(&uri(&broker.address())).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.subscribe(&Destination::topic("t"), None, tx).await.unwrap();

        assert!(network.remove_broker("main"));
        assert!(rx.recv().await.is_none());
        assert!(!session.is_open());
        assert!(session
            .publish(&Destination::topic("t"), Envelope::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_removes_session_consumers() {
        let network = MemoryNetwork::new();
        let broker = network.add_broker("main");
        let session = network.connector().connect(&uri(&broker.address())).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.subscribe(&Destination::topic("t"), None, tx).await.unwrap();
        assert_eq!(broker.subscription_count(), 1);

        session.close().await.unwrap();
        assert_eq!(broker.subscription_count(), 0);
        assert!(matches!(
            session.publish(&Destination::topic("t"), Envelope::default()).await,
            Err(Error::NotConnected)
        ));
    }
}
