//! Peer coordinator - membership and liveness over one peer channel
//!
//! Startup announces this node with STARTING and asks who else is there
//! with DISCOVER. Peers answer RUNNING, depart with STOPPING and, when a
//! ping rate is set, answer PING with PONG. Every protocol message updates
//! the registry, and every update or query sweeps out peers that have gone
//! quiet.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelListener, ChannelSpec, ConnectionManager};
use crate::error::{Error, Result};
use crate::protocol::{Body, ControlSubtype, Envelope, MessageKind, BROADCAST};

use super::events::{CoordinatorEvent, CoordinatorSettings, CoordinatorState, LeaveReason};
use super::heartbeat::Heartbeat;
use super::registry::{PeerRecord, PeerRegistry};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// State guarded by the coordinator lock
struct Core {
    state: CoordinatorState,
    start_time: Option<i64>,
    registry: PeerRegistry,
    channel: Option<Channel>,
}

struct CoordinatorInner {
    settings: CoordinatorSettings,
    manager: Arc<ConnectionManager>,
    core: Mutex<Core>,
    events: mpsc::Sender<CoordinatorEvent>,
    heartbeat: Heartbeat,
    startup: Mutex<Option<JoinHandle<()>>>,
}

/// Membership protocol endpoint for one plugin on one server
pub struct PeerCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PeerCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        manager: Arc<ConnectionManager>,
        events: mpsc::Sender<CoordinatorEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                settings,
                manager,
                core: Mutex::new(Core {
                    state: CoordinatorState::NotStarted,
                    start_time: None,
                    registry: PeerRegistry::new(),
                    channel: None,
                }),
                events,
                heartbeat: Heartbeat::new(),
                startup: Mutex::new(None),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.settings.server_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.settings.plugin_id
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.core.lock().state
    }

    /// Start time announced to peers, once startup has reached it
    pub fn start_time(&self) -> Option<i64> {
        self.inner.core.lock().start_time
    }

    /// Known peers, oldest first. Includes this server once it has
    /// heard its own announcement. Timed-out peers are evicted first.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.swept(|registry| registry.snapshot())
    }

    pub fn has_peer(&self, server_id: &str) -> bool {
        self.inner.swept(|registry| registry.has(server_id))
    }

    pub fn oldest_peer(&self) -> Option<PeerRecord> {
        self.inner.swept(|registry| registry.oldest().cloned())
    }

    pub fn newest_peer(&self) -> Option<PeerRecord> {
        self.inner.swept(|registry| registry.newest().cloned())
    }

    /// Begin startup in the background. Accepted from `NotStarted` and
    /// `Failed`; a no-op while starting or running.
    pub fn start(&self) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            match core.state {
                CoordinatorState::NotStarted | CoordinatorState::Failed => {}
                CoordinatorState::Starting | CoordinatorState::Running => return Ok(()),
                CoordinatorState::Stopped => {
                    return Err(Error::NotRunning {
                        state: core.state.to_string(),
                    })
                }
            }
            core.state = CoordinatorState::Starting;
        }
        info!(
            server_id = %self.server_id(),
            plugin_id = %self.plugin_id(),
            "Coordinator starting"
        );
        self.inner.emit(CoordinatorEvent::StateChanged(CoordinatorState::Starting));

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_startup().await });
        if let Some(previous) = self.inner.startup.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Send an application message to one server, or `*` for all.
    /// Refused unless running.
    pub async fn send_to(&self, to: &str, body: Body) -> Result<()> {
        self.inner.send_user(to, body).await
    }

    pub async fn broadcast(&self, body: Body) -> Result<()> {
        self.inner.send_user(BROADCAST, body).await
    }

    /// Send to the peer with the earliest start time. Returns false when
    /// no peer is known.
    pub async fn send_to_oldest(&self, body: Body) -> Result<bool> {
        let target = self.oldest_peer().map(|p| p.server_id);
        match target {
            Some(to) => self.inner.send_user(&to, body).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Send to the peer with the latest start time. Returns false when no
    /// peer is known.
    pub async fn send_to_newest(&self, body: Body) -> Result<bool> {
        let target = self.newest_peer().map(|p| p.server_id);
        match target {
            Some(to) => self.inner.send_user(&to, body).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub fn ping_rate(&self) -> u64 {
        self.inner.heartbeat.rate()
    }

    /// Ping all peers every `rate_secs` (randomized). Zero disables; the
    /// heartbeat task has stopped by the time this returns.
    pub async fn set_ping_rate(&self, rate_secs: u64) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .heartbeat
            .set_rate(rate_secs, move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            inner.send_ping().await;
                            true
                        }
                        None => false,
                    }
                }
            })
            .await;
        debug!(server_id = %self.server_id(), rate_secs, "Ping rate set");
    }

    /// Stop heartbeats, say goodbye if running, and release the connection
    pub async fn stop(&self) {
        self.set_ping_rate(0).await;
        let startup = self.inner.startup.lock().take();
        if let Some(startup) = startup {
            startup.abort();
        }

        if self.state() == CoordinatorState::Running {
            if let Err(e) = self.inner.send_control(ControlSubtype::Stopping, BROADCAST).await {
                warn!(error = %e, "Failed to announce STOPPING");
            }
        }

        let previous = {
            let mut core = self.inner.core.lock();
            std::mem::replace(&mut core.state, CoordinatorState::Stopped)
        };
        self.inner.manager.release().await;

        if previous != CoordinatorState::Stopped {
            info!(server_id = %self.server_id(), "Coordinator stopped");
            self.inner.emit(CoordinatorEvent::StateChanged(CoordinatorState::Stopped));
        }
    }
}

impl CoordinatorInner {
    async fn run_startup(self: Arc<Self>) {
        tokio::time::sleep(self.settings.settle_delay).await;

        match self.startup_steps().await {
            Ok(()) => {
                let promoted = {
                    let mut core = self.core.lock();
                    if core.state == CoordinatorState::Starting {
                        core.state = CoordinatorState::Running;
                        true
                    } else {
                        false
                    }
                };
                if promoted {
                    info!(server_id = %self.settings.server_id, "Coordinator running");
                    self.emit(CoordinatorEvent::StateChanged(CoordinatorState::Running));
                }
            }
            Err(e) => {
                error!(
                    server_id = %self.settings.server_id,
                    error = %e,
                    "Coordinator startup failed"
                );
                self.fail();
            }
        }
    }

    async fn startup_steps(self: &Arc<Self>) -> Result<()> {
        let existing = self.core.lock().channel.clone();
        if existing.is_none() {
            let listener = Arc::new(ProtocolListener {
                inner: Arc::downgrade(self),
            });
            let spec = ChannelSpec::peer(&self.settings.plugin_id, &self.settings.server_id, listener);
            let channel = self.manager.register_channel(spec).await?;
            self.core.lock().channel = Some(channel);
        }
        self.manager.start().await?;

        self.core.lock().start_time = Some(now_ms());
        self.send_control(ControlSubtype::Starting, BROADCAST).await?;
        self.send_control(ControlSubtype::Discover, BROADCAST).await?;
        Ok(())
    }

    fn fail(&self) {
        let changed = {
            let mut core = self.core.lock();
            if core.state.is_active() {
                core.state = CoordinatorState::Failed;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(CoordinatorEvent::StateChanged(CoordinatorState::Failed));
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = ?event, "Coordinator event queue full, dropping event")
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────

    async fn send_control(&self, subtype: ControlSubtype, to: &str) -> Result<()> {
        let (channel, start_time) = {
            let core = self.core.lock();
            let ready = match (&core.channel, core.start_time) {
                (Some(channel), Some(start)) if core.state.is_active() => Some((channel.clone(), start)),
                _ => None,
            };
            match ready {
                Some(ready) => ready,
                None => {
                    error!(
                        subtype = %subtype,
                        state = %core.state,
                        "Unable to send coordination message, not started or starting failed"
                    );
                    return Err(Error::NotRunning {
                        state: core.state.to_string(),
                    });
                }
            }
        };

        let envelope = Envelope::control(
            subtype,
            to,
            &self.settings.server_id,
            start_time,
            &self.settings.plugin_id,
        );
        debug!(server_id = %self.settings.server_id, subtype = %subtype, to, "Sending coordination");
        let sent = channel.send(envelope).await;
        self.check_channel(&sent);
        sent
    }

    async fn send_user(&self, to: &str, body: Body) -> Result<()> {
        let channel = {
            let core = self.core.lock();
            match (&core.channel, core.state) {
                (Some(channel), CoordinatorState::Running) => channel.clone(),
                _ => {
                    error!(
                        to,
                        state = %core.state,
                        "Unable to send message, not running"
                    );
                    return Err(Error::NotRunning {
                        state: core.state.to_string(),
                    });
                }
            }
        };

        let envelope = Envelope::user(to, &self.settings.server_id, &self.settings.plugin_id, body);
        debug!(server_id = %self.settings.server_id, to, "Sending user message");
        let sent = channel.send(envelope).await;
        self.check_channel(&sent);
        sent
    }

    /// A released manager cannot come back; anything else is transient
    fn check_channel(&self, sent: &Result<()>) {
        if let Err(Error::ManagerReleased) = sent {
            self.fail();
        }
    }

    async fn send_ping(&self) {
        if self.core.lock().state != CoordinatorState::Running {
            return;
        }
        if let Err(e) = self.send_control(ControlSubtype::Ping, BROADCAST).await {
            debug!(error = %e, "Ping not sent");
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────

    async fn handle_message(&self, envelope: Envelope) {
        let kind = match envelope.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return;
            }
        };
        let Some(from) = envelope.from_server_id().map(str::to_string) else {
            warn!("Dropping message without fromServerId");
            return;
        };

        match kind {
            MessageKind::User => {
                debug!(server_id = %self.settings.server_id, from = %from, "Received user message");
                self.emit(CoordinatorEvent::Message {
                    from,
                    body: envelope.body,
                });
            }
            MessageKind::Coordination => {
                if let Err(e) = self.handle_control(&envelope, &from).await {
                    warn!(from = %from, error = %e, "Dropping malformed coordination message");
                }
            }
        }
    }

    async fn handle_control(&self, envelope: &Envelope, from: &str) -> Result<()> {
        let subtype = envelope.subtype()?;
        debug!(server_id = %self.settings.server_id, subtype = %subtype, from, "Received coordination");

        match subtype {
            ControlSubtype::Starting | ControlSubtype::Running => {
                let start_time = envelope.from_start_time()?;
                self.record(from, Contact::Announced(start_time));
            }
            ControlSubtype::Discover => {
                let start_time = envelope.from_start_time()?;
                if let Err(e) = self.send_control(ControlSubtype::Running, from).await {
                    debug!(to = from, error = %e, "RUNNING reply not sent");
                }
                self.record(from, Contact::Announced(start_time));
            }
            ControlSubtype::Stopping => self.record(from, Contact::Departed),
            ControlSubtype::Ping => {
                if from != self.settings.server_id {
                    if let Err(e) = self.send_control(ControlSubtype::Pong, from).await {
                        debug!(to = from, error = %e, "PONG reply not sent");
                    }
                }
                self.record(from, Contact::Seen);
            }
            ControlSubtype::Pong => self.record(from, Contact::Seen),
        }
        Ok(())
    }

    /// Apply one contact to the registry, sweep, and report changes
    fn record(&self, from: &str, contact: Contact) {
        let now = now_ms();
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            let mut changed = false;
            match contact {
                Contact::Announced(start_time) => {
                    if core.registry.add(from, start_time, now) {
                        changed = true;
                        events.push(CoordinatorEvent::PeerJoined {
                            server_id: from.to_string(),
                            start_time,
                        });
                    }
                    core.registry.touch(from, now);
                }
                Contact::Departed => {
                    if core.registry.remove(from).is_some() {
                        changed = true;
                        events.push(CoordinatorEvent::PeerLeft {
                            server_id: from.to_string(),
                            reason: LeaveReason::Departed,
                        });
                    }
                }
                Contact::Seen => {
                    core.registry.touch(from, now);
                }
            }

            let timed_out = evict_silent(&mut core.registry, now);
            changed |= !timed_out.is_empty();
            events.extend(timed_out);

            if changed {
                core.registry.log_peers(&self.settings.server_id, now);
            }
        }

        for event in events {
            self.emit(event);
        }
    }

    /// Read the registry after evicting peers that have gone quiet
    fn swept<R>(&self, read: impl FnOnce(&PeerRegistry) -> R) -> R {
        let now = now_ms();
        let (result, events) = {
            let mut core = self.core.lock();
            let events = evict_silent(&mut core.registry, now);
            if !events.is_empty() {
                core.registry.log_peers(&self.settings.server_id, now);
            }
            (read(&core.registry), events)
        };

        for event in events {
            self.emit(event);
        }
        result
    }

    async fn on_reopened(&self) {
        if self.core.lock().state != CoordinatorState::Running {
            return;
        }
        info!(server_id = %self.settings.server_id, "Channel reopened, rediscovering peers");
        if let Err(e) = self.send_control(ControlSubtype::Discover, BROADCAST).await {
            warn!(error = %e, "Rediscovery failed");
        }
    }
}

fn evict_silent(registry: &mut PeerRegistry, now: i64) -> Vec<CoordinatorEvent> {
    registry
        .sweep(now)
        .into_iter()
        .map(|peer| {
            info!(peer = %peer.server_id, "Peer timed out");
            CoordinatorEvent::PeerLeft {
                server_id: peer.server_id,
                reason: LeaveReason::TimedOut,
            }
        })
        .collect()
}

enum Contact {
    Announced(i64),
    Departed,
    Seen,
}

/// Feeds the peer channel into the coordinator without keeping it alive
struct ProtocolListener {
    inner: Weak<CoordinatorInner>,
}

#[async_trait]
impl ChannelListener for ProtocolListener {
    async fn on_message(&self, envelope: Envelope) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_message(envelope).await;
        }
    }

    async fn on_reopened(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_reopened().await;
        }
    }
}

impl Drop for PeerCoordinator {
    fn drop(&mut self) {
        if let Some(startup) = self.inner.startup.lock().take() {
            startup.abort();
        }
    }
}
