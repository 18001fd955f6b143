//! Connection manager
//!
//! Owns the one session to the bus and the channels opened on it. When the
//! broker address changes, every channel is closed, the session is rebuilt
//! against the new address and every channel is opened again with the
//! configuration it was registered with.
//!
//! Lifecycle: `Idle -> Connected -> Stopped`. Channels may only be
//! registered while `Idle`. Having a session is tracked separately from
//! being started; delivery to listeners only happens when both hold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::discovery::{AddressObserver, BrokerAddress, BrokerLocationSource, ObserverId};
use crate::error::{Error, Result};
use crate::protocol::{AddressFilter, Destination, Envelope};
use crate::transport::{BusConnector, BusSession, ConsumerId, FailoverPolicy, FailoverUri};

use super::descriptor::{ChannelListener, ChannelSpec};

/// Manager lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Idle,
    Connected,
    Stopped,
}

impl std::fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerPhase::Idle => write!(f, "idle"),
            ManagerPhase::Connected => write!(f, "connected"),
            ManagerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot published after every reconnect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Incremented on every successful (re)connect
    pub generation: u64,
    pub connected: bool,
    pub address: Option<BrokerAddress>,
}

// ─────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────

struct ConsumerSide {
    id: ConsumerId,
    session: Arc<dyn BusSession>,
    task: JoinHandle<()>,
}

struct ChannelInner {
    spec: ChannelSpec,
    destination: Destination,
    manager: Weak<ManagerInner>,
    producer_open: AtomicBool,
    consumer: SyncMutex<Option<ConsumerSide>>,
}

/// Handle to a registered channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn has_producer(&self) -> bool {
        self.inner.spec.producer
    }

    pub fn has_consumer(&self) -> bool {
        self.inner.spec.has_consumer()
    }

    pub fn filter(&self) -> Option<&AddressFilter> {
        self.inner.spec.filter.as_ref()
    }

    /// True while the channel's sides are open on a live session
    pub fn is_open(&self) -> bool {
        let consumer_ok = !self.has_consumer() || self.inner.consumer.lock().is_some();
        let producer_ok = !self.has_producer() || self.inner.producer_open.load(Ordering::SeqCst);
        consumer_ok && producer_ok && (self.has_consumer() || self.has_producer())
    }

    /// Publish an envelope. Fails, without sending, when the producer side
    /// is not open.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        let manager = self.inner.manager.upgrade().ok_or(Error::ManagerReleased)?;
        let state = manager.state.lock().await;

        if !self.inner.producer_open.load(Ordering::SeqCst) {
            warn!(channel = %self.name(), "Send rejected, no producer open");
            return Err(Error::NoProducer {
                channel: self.name().to_string(),
            });
        }
        let session = state.session.as_ref().ok_or(Error::NotConnected)?;

        trace!(
            channel = %self.name(),
            to = envelope.to_server_id().unwrap_or(""),
            "Sending"
        );
        session.publish(&self.inner.destination, envelope).await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("spec", &self.inner.spec)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ChannelInner {
    async fn open(&self, session: &Arc<dyn BusSession>, delivering: &Arc<AtomicBool>) -> Result<()> {
        if let Some(listener) = &self.spec.listener {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = session
                .subscribe(&self.destination, self.spec.filter.clone(), tx)
                .await?;
            let task = spawn_delivery(
                self.spec.name.clone(),
                self.spec.filter.clone(),
                listener.clone(),
                delivering.clone(),
                rx,
            );
            let previous = self.consumer.lock().replace(ConsumerSide {
                id,
                session: session.clone(),
                task,
            });
            if let Some(previous) = previous {
                previous.task.abort();
            }
        }
        if self.spec.producer {
            self.producer_open.store(true, Ordering::SeqCst);
        }
        debug!(
            channel = %self.spec.name,
            producer = self.spec.producer,
            consumer = self.spec.has_consumer(),
            "Channel opened"
        );
        Ok(())
    }

    async fn close(&self) {
        self.producer_open.store(false, Ordering::SeqCst);
        let side = self.consumer.lock().take();
        if let Some(side) = side {
            side.task.abort();
            if let Err(e) = side.session.unsubscribe(side.id).await {
                debug!(channel = %self.spec.name, error = %e, "Unsubscribe failed");
            }
            // No callback may outlive the close
            let _ = side.task.await;
        }
    }
}

fn spawn_delivery(
    channel: String,
    filter: Option<AddressFilter>,
    listener: Arc<dyn ChannelListener>,
    delivering: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if !delivering.load(Ordering::SeqCst) {
                trace!(channel = %channel, "Delivery stopped, dropping message");
                continue;
            }
            if let Some(filter) = &filter {
                if !filter.matches(&envelope) {
                    trace!(channel = %channel, "Filtered out");
                    continue;
                }
            }
            listener.on_message(envelope).await;
        }
        trace!(channel = %channel, "Consumer stream ended");
    })
}

// ─────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────

struct ManagerState {
    phase: ManagerPhase,
    started: bool,
    address: Option<BrokerAddress>,
    session: Option<Arc<dyn BusSession>>,
    channels: Vec<Arc<ChannelInner>>,
    generation: u64,
}

struct ManagerInner {
    connector: Arc<dyn BusConnector>,
    location: Arc<BrokerLocationSource>,
    policy: FailoverPolicy,
    /// Manager-wide lock: reconnects, registration, lifecycle and sends
    state: Mutex<ManagerState>,
    delivering: Arc<AtomicBool>,
    status: watch::Sender<ConnectionStatus>,
    observer: SyncMutex<Option<ObserverId>>,
    reconnect_task: SyncMutex<Option<JoinHandle<()>>>,
}

/// Forwards broker address changes to the reconnect task
struct ReconnectTrigger {
    tx: mpsc::UnboundedSender<Option<BrokerAddress>>,
}

impl AddressObserver for ReconnectTrigger {
    fn address_changed(&self, address: Option<BrokerAddress>) {
        if self.tx.send(address).is_err() {
            debug!("Reconnect task gone, ignoring address change");
        }
    }
}

/// Owns the bus session and its channels
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Build a manager and subscribe it to broker address changes. The
    /// current address, if any, is connected to straight away.
    pub fn new(
        connector: Arc<dyn BusConnector>,
        location: Arc<BrokerLocationSource>,
        policy: FailoverPolicy,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let inner = Arc::new(ManagerInner {
            connector,
            location: location.clone(),
            policy,
            state: Mutex::new(ManagerState {
                phase: ManagerPhase::Idle,
                started: false,
                address: None,
                session: None,
                channels: Vec::new(),
                generation: 0,
            }),
            delivering: Arc::new(AtomicBool::new(false)),
            status,
            observer: SyncMutex::new(None),
            reconnect_task: SyncMutex::new(None),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<BrokerAddress>>();
        let weak = Arc::downgrade(&inner);
        let task = tokio::spawn(async move {
            while let Some(mut address) = rx.recv().await {
                // Only the latest address matters
                while let Ok(next) = rx.try_recv() {
                    address = next;
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.reconnect(address).await;
            }
        });
        *inner.reconnect_task.lock() = Some(task);

        let id = location.subscribe(Arc::new(ReconnectTrigger { tx }));
        *inner.observer.lock() = Some(id);

        Self { inner }
    }

    /// Register a channel. Only allowed before the manager is started.
    pub async fn register_channel(&self, spec: ChannelSpec) -> Result<Channel> {
        let mut state = self.inner.state.lock().await;
        match state.phase {
            ManagerPhase::Idle => {}
            ManagerPhase::Connected => {
                return Err(Error::RegistrationClosed {
                    channel: spec.name.clone(),
                })
            }
            ManagerPhase::Stopped => return Err(Error::ManagerReleased),
        }

        let inner = Arc::new(ChannelInner {
            destination: spec.destination(),
            spec,
            manager: Arc::downgrade(&self.inner),
            producer_open: AtomicBool::new(false),
            consumer: SyncMutex::new(None),
        });

        if let Some(session) = state.session.clone() {
            if let Err(e) = inner.open(&session, &self.inner.delivering).await {
                warn!(channel = %inner.spec.name, error = %e, "Channel registered but not opened");
            }
        } else {
            debug!(channel = %inner.spec.name, "Channel pending until a broker is known");
        }

        state.channels.push(inner.clone());
        Ok(Channel { inner })
    }

    /// Begin delivering to listeners. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.phase == ManagerPhase::Stopped {
            return Err(Error::ManagerReleased);
        }
        if !state.started {
            info!(connected = state.session.is_some(), "Connection manager started");
        }
        state.phase = ManagerPhase::Connected;
        state.started = true;
        self.inner
            .delivering
            .store(state.session.is_some(), Ordering::SeqCst);
        Ok(())
    }

    /// Pause delivery, keeping the session
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase != ManagerPhase::Connected {
            return;
        }
        state.phase = ManagerPhase::Idle;
        state.started = false;
        self.inner.delivering.store(false, Ordering::SeqCst);
        info!("Connection manager stopped");
    }

    /// Tear everything down for good
    pub async fn release(&self) {
        if let Some(id) = self.inner.observer.lock().take() {
            self.inner.location.unsubscribe(id);
        }
        let task = self.inner.reconnect_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        let mut state = self.inner.state.lock().await;
        if state.phase == ManagerPhase::Stopped {
            return;
        }
        state.phase = ManagerPhase::Stopped;
        state.started = false;
        self.inner.delivering.store(false, Ordering::SeqCst);

        for channel in state.channels.drain(..) {
            channel.close().await;
        }
        if let Some(session) = state.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Session close failed");
            }
        }
        state.address = None;

        let generation = state.generation;
        self.inner.status.send_replace(ConnectionStatus {
            generation,
            connected: false,
            address: None,
        });
        info!("Connection manager released");
    }

    pub async fn phase(&self) -> ManagerPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.state.lock().await.channels.len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().connected
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until a connection of at least `generation` is up
    pub async fn wait_connected(&self, generation: u64, timeout: Duration) -> Result<ConnectionStatus> {
        let mut rx = self.status();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if status.connected && status.generation >= generation {
                        return Ok(status.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ManagerReleased);
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout {
                url: self
                    .inner
                    .location
                    .current_address()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl ManagerInner {
    async fn reconnect(&self, address: Option<BrokerAddress>) {
        let reopened: Vec<Arc<dyn ChannelListener>> = {
            let mut state = self.state.lock().await;
            if state.phase == ManagerPhase::Stopped {
                return;
            }
            let healthy = state.session.as_ref().map(|s| s.is_open()).unwrap_or(false);
            if healthy && state.address == address {
                debug!("Broker address unchanged, keeping connection");
                return;
            }

            self.delivering.store(false, Ordering::SeqCst);
            for channel in &state.channels {
                channel.close().await;
            }
            if let Some(session) = state.session.take() {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Session close failed");
                }
            }
            state.address = address.clone();

            let mut reopened = Vec::new();
            match &address {
                Some(address) => match self.connect(address).await {
                    Ok(session) => {
                        state.session = Some(session.clone());
                        for channel in &state.channels {
                            match channel.open(&session, &self.delivering).await {
                                Ok(()) => {
                                    if let Some(listener) = &channel.spec.listener {
                                        reopened.push(listener.clone());
                                    }
                                }
                                Err(e) => {
                                    warn!(channel = %channel.spec.name, error = %e, "Failed to reopen channel")
                                }
                            }
                        }
                        state.generation += 1;
                        info!(
                            address = %address,
                            generation = state.generation,
                            channels = state.channels.len(),
                            "Connected to broker"
                        );
                    }
                    Err(e) => {
                        error!(address = %address, error = %e, "Broker connection failed, waiting for next address");
                    }
                },
                None => info!("No broker address, connection closed"),
            }

            self.delivering
                .store(state.started && state.session.is_some(), Ordering::SeqCst);
            self.status.send_replace(ConnectionStatus {
                generation: state.generation,
                connected: state.session.is_some(),
                address: state.address.clone(),
            });
            reopened
        };

        for listener in reopened {
            listener.on_reopened().await;
        }
    }

    async fn connect(&self, address: &BrokerAddress) -> Result<Arc<dyn BusSession>> {
        let uri = FailoverUri::from_address(address.as_str(), &self.policy)?;
        debug!(uri = %uri, "Opening broker connection");
        self.connector.connect(&uri).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(id) = self.inner.observer.lock().take() {
            self.inner.location.unsubscribe(id);
        }
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
    }
}
