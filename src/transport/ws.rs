//! WebSocket bus client
//!
//! Talks JSON `BusFrame`s to a relay broker. One driver task owns the
//! socket; publishes and subscriptions reach it through a command channel,
//! so frames issued while the socket is being re-established are queued.
//! A dropped socket is re-opened up to `maxReconnectAttempts` rounds and
//! every live consumer is re-subscribed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{AddressFilter, BusFrame, Destination, Envelope};

use super::failover::{connect_with_retry, FailoverUri};
use super::{BusConnector, BusSession, ConsumerId, EnvelopeSink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default time allowed for one WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector for `ws://` relay addresses
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

async fn open_socket(url: String, timeout: Duration) -> Result<WsStream> {
    let parsed = Url::parse(&url).map_err(|e| Error::connection_failed(&url, e.to_string()))?;
    if parsed.scheme() != "ws" {
        return Err(Error::connection_failed(&url, "only ws:// relays are supported"));
    }

    match tokio::time::timeout(timeout, connect_async(parsed.as_str())).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(Error::connection_failed(&url, e.to_string())),
        Err(_) => Err(Error::ConnectionTimeout {
            url,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[async_trait]
impl BusConnector for WsConnector {
    async fn connect(&self, uri: &FailoverUri) -> Result<Arc<dyn BusSession>> {
        let timeout = self.connect_timeout;
        let socket = connect_with_retry(uri, uri.policy.startup_max_reconnect_attempts, |url| {
            open_socket(url, timeout)
        })
        .await?;
        info!(uri = %uri, "Connected to relay");
        Ok(WsSession::start(socket, uri.clone(), timeout))
    }
}

// ─────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────

enum Command {
    Frame(BusFrame),
    Close,
}

struct Consumer {
    destination: Destination,
    selector: Option<AddressFilter>,
    sink: EnvelopeSink,
}

struct Shared {
    open: AtomicBool,
    consumers: Mutex<HashMap<ConsumerId, Consumer>>,
}

impl Shared {
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sinks ends every consumer stream
        self.consumers.lock().clear();
    }
}

/// Live relay session
pub struct WsSession {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    next_consumer: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl WsSession {
    fn start(socket: WsStream, uri: FailoverUri, connect_timeout: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            consumers: Mutex::new(HashMap::new()),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(shared.clone(), socket, uri, connect_timeout, command_rx));

        Arc::new(Self {
            shared,
            commands,
            next_consumer: AtomicU64::new(1),
            driver: Mutex::new(Some(driver)),
        })
    }

    fn submit(&self, frame: BusFrame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        self.commands
            .send(Command::Frame(frame))
            .map_err(|_| Error::ConnectionLost {
                message: "relay session driver has stopped".to_string(),
            })
    }
}

#[async_trait]
impl BusSession for WsSession {
    async fn publish(&self, destination: &Destination, envelope: Envelope) -> Result<()> {
        self.submit(BusFrame::Publish {
            destination: destination.clone(),
            envelope,
        })
    }

    async fn subscribe(
        &self,
        destination: &Destination,
        selector: Option<AddressFilter>,
        sink: EnvelopeSink,
    ) -> Result<ConsumerId> {
        let consumer = self.next_consumer.fetch_add(1, Ordering::SeqCst);
        self.shared.consumers.lock().insert(
            consumer,
            Consumer {
                destination: destination.clone(),
                selector: selector.clone(),
                sink,
            },
        );
        let submitted = self.submit(BusFrame::Subscribe {
            consumer,
            destination: destination.clone(),
            selector,
        });
        if let Err(e) = submitted {
            self.shared.consumers.lock().remove(&consumer);
            return Err(e);
        }
        Ok(consumer)
    }

    async fn unsubscribe(&self, consumer: ConsumerId) -> Result<()> {
        if self.shared.consumers.lock().remove(&consumer).is_none() {
            return Ok(());
        }
        self.submit(BusFrame::Unsubscribe { consumer })
    }

    async fn close(&self) -> Result<()> {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close);
            let driver = self.driver.lock().take();
            if let Some(driver) = driver {
                if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
                    warn!("Relay session driver did not stop in time");
                }
            }
            self.shared.shut();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────

enum SocketEnd {
    /// Session closed by its owner
    Closed,
    /// Socket failed underneath a live session
    Dropped(Error),
}

async fn drive(
    shared: Arc<Shared>,
    mut socket: WsStream,
    uri: FailoverUri,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        match run_socket(&shared, socket, &mut commands).await {
            SocketEnd::Closed => break,
            SocketEnd::Dropped(e) => {
                if !shared.open.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "Relay connection dropped, reconnecting");
                let reopened = connect_with_retry(&uri, uri.policy.max_reconnect_attempts, |url| {
                    open_socket(url, connect_timeout)
                })
                .await;
                match reopened {
                    Ok(next) => {
                        info!(uri = %uri, "Relay connection re-established");
                        socket = next;
                    }
                    Err(e) => {
                        error!(error = %e, "Relay reconnect attempts exhausted");
                        break;
                    }
                }
            }
        }
    }

    shared.shut();
    debug!("Relay session driver stopped");
}

async fn run_socket(
    shared: &Shared,
    socket: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SocketEnd {
    let (mut write, mut read) = socket.split();

    // Replay consumers so a re-opened socket picks up where the last left off
    let existing: Vec<BusFrame> = shared
        .consumers
        .lock()
        .iter()
        .map(|(id, c)| BusFrame::Subscribe {
            consumer: *id,
            destination: c.destination.clone(),
            selector: c.selector.clone(),
        })
        .collect();
    for frame in existing {
        if let Err(e) = send_frame(&mut write, &frame).await {
            return SocketEnd::Dropped(e);
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Frame(frame)) => {
                        if let Err(e) = send_frame(&mut write, &frame).await {
                            return SocketEnd::Dropped(e);
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return SocketEnd::Closed;
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = dispatch(shared, &text) {
                            warn!(error = %e, "Ignoring relay frame");
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = write.send(WsMessage::Pong(data)).await {
                            return SocketEnd::Dropped(e.into());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SocketEnd::Dropped(Error::ConnectionLost {
                            message: "closed by relay".to_string(),
                        });
                    }
                    Some(Err(e)) => return SocketEnd::Dropped(e.into()),
                    _ => {}
                }
            }
        }
    }
}

async fn send_frame(write: &mut SplitSink<WsStream, WsMessage>, frame: &BusFrame) -> Result<()> {
    let json = frame.to_json()?;
    write.send(WsMessage::Text(json)).await?;
    Ok(())
}

/// Route one relay frame to its consumer. Frames a client never expects
/// come back as `Error::Protocol`.
fn dispatch(shared: &Shared, text: &str) -> Result<()> {
    match BusFrame::from_json(text)? {
        BusFrame::Deliver { consumer, envelope } => {
            let consumers = shared.consumers.lock();
            match consumers.get(&consumer) {
                Some(c) => {
                    let _ = c.sink.send(envelope);
                }
                None => debug!(consumer, "Delivery for unknown consumer"),
            }
            Ok(())
        }
        BusFrame::Error { message } => Err(Error::Protocol(format!("relay reported: {}", message))),
        other => Err(Error::Protocol(format!("unexpected {} frame from relay", other.op_name()))),
    }
}
