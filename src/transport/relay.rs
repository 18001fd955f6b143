//! WebSocket relay broker
//!
//! A small pub/sub broker for `ws://` clients. Consumer selectors are
//! applied here, so clients only receive what they asked for. Topics fan
//! out to every matching consumer, queues hand each message to one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{AddressFilter, BusFrame, Destination, DestinationKind, Envelope};

use super::ConsumerId;

type ClientId = u64;

struct RelaySubscription {
    client: ClientId,
    consumer: ConsumerId,
    destination: Destination,
    selector: Option<AddressFilter>,
}

#[derive(Default)]
struct Hub {
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<BusFrame>>>,
    subscriptions: Mutex<Vec<RelaySubscription>>,
    next_client: AtomicU64,
}

impl Hub {
    fn join(&self, outbound: mpsc::UnboundedSender<BusFrame>) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        self.clients.lock().insert(id, outbound);
        id
    }

    fn leave(&self, client: ClientId) {
        self.clients.lock().remove(&client);
        self.subscriptions.lock().retain(|s| s.client != client);
    }

    fn subscribe(
        &self,
        client: ClientId,
        consumer: ConsumerId,
        destination: Destination,
        selector: Option<AddressFilter>,
    ) {
        let mut subs = self.subscriptions.lock();
        // Clients replay subscriptions after reconnecting; the latest wins
        subs.retain(|s| !(s.client == client && s.consumer == consumer));
        subs.push(RelaySubscription {
            client,
            consumer,
            destination,
            selector,
        });
    }

    fn unsubscribe(&self, client: ClientId, consumer: ConsumerId) {
        self.subscriptions
            .lock()
            .retain(|s| !(s.client == client && s.consumer == consumer));
    }

    /// Route a published envelope, returning how many consumers got it
    fn publish(&self, destination: &Destination, envelope: Envelope) -> usize {
        let targets: Vec<(ClientId, ConsumerId)> = {
            let subs = self.subscriptions.lock();
            let mut matching = subs.iter().filter(|s| {
                s.destination == *destination
                    && s.selector.as_ref().map(|f| f.matches(&envelope)).unwrap_or(true)
            });
            match destination.kind {
                DestinationKind::Topic => matching.map(|s| (s.client, s.consumer)).collect(),
                DestinationKind::Queue => matching.next().map(|s| (s.client, s.consumer)).into_iter().collect(),
            }
        };

        let clients = self.clients.lock();
        let mut delivered = 0;
        for (client, consumer) in targets {
            if let Some(tx) = clients.get(&client) {
                let frame = BusFrame::Deliver {
                    consumer,
                    envelope: envelope.clone(),
                };
                if tx.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Relay server
// ─────────────────────────────────────────────────────────────────

/// Bound relay broker, not yet accepting
pub struct BusRelay {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl BusRelay {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, format!("bind failed: {}", e)))?;
        Ok(Self {
            listener,
            hub: Arc::new(Hub::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address clients connect to
    pub fn url(&self) -> Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    /// Accept clients until the task is dropped
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Relay listening");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Relay client connecting");
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(hub, stream).await {
                            debug!(peer_addr = %peer_addr, error = %e, "Relay client failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn handle_client(hub: Arc<Hub>, stream: TcpStream) -> anyhow::Result<()> {
    let socket = accept_async(stream).await?;
    let (mut write, mut read) = socket.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<BusFrame>();
    let client = hub.join(outbound.clone());
    info!(client, "Relay client joined");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match frame.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if write.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = write.send(WsMessage::Close(None)).await;
    });

    let result = read_frames(&hub, client, &outbound, &mut read).await;

    hub.leave(client);
    drop(outbound);
    writer.abort();
    info!(client, "Relay client left");
    result
}

async fn read_frames<R>(
    hub: &Hub,
    client: ClientId,
    outbound: &mpsc::UnboundedSender<BusFrame>,
    read: &mut R,
) -> anyhow::Result<()>
where
    R: StreamExt<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let text = match msg? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        match BusFrame::from_json(&text) {
            Ok(BusFrame::Subscribe {
                consumer,
                destination,
                selector,
            }) => {
                debug!(client, consumer, destination = %destination.name, "Subscribe");
                hub.subscribe(client, consumer, destination, selector);
            }
            Ok(BusFrame::Unsubscribe { consumer }) => {
                debug!(client, consumer, "Unsubscribe");
                hub.unsubscribe(client, consumer);
            }
            Ok(BusFrame::Publish {
                destination,
                envelope,
            }) => {
                let delivered = hub.publish(&destination, envelope);
                trace!(client, destination = %destination.name, delivered, "Publish");
            }
            Ok(other) => {
                let _ = outbound.send(BusFrame::Error {
                    message: format!("clients may not send '{}' frames", other.op_name()),
                });
            }
            Err(e) => {
                warn!(client, error = %e, "Malformed frame from client");
                let _ = outbound.send(BusFrame::Error {
                    message: format!("malformed frame: {}", e),
                });
            }
        }
    }
    Ok(())
}
