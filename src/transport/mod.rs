//! Bus transports
//!
//! A `BusConnector` opens a `BusSession` against a failover URI. Sessions
//! publish envelopes to destinations and feed subscribed consumers through
//! unbounded channels. Two transports ship with the crate:
//!
//! - `memory` - an in-process bus, addressed as `memory://<name>`
//! - `ws` - a WebSocket client for the `relay` broker

mod failover;
mod memory;
mod relay;
mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{AddressFilter, Destination, Envelope};

pub use failover::{connect_with_retry, FailoverPolicy, FailoverUri, MAX_RECONNECT_DELAY};
pub use memory::{MemoryBroker, MemoryConnector, MemoryNetwork, MEMORY_SCHEME};
pub use relay::BusRelay;
pub use ws::{WsConnector, WsSession};

/// Identifies a consumer within one session
pub type ConsumerId = u64;

/// Sink that receives envelopes for one consumer
pub type EnvelopeSink = mpsc::UnboundedSender<Envelope>;

/// Opens sessions to the bus
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connect using the startup retry bound of the URI's policy
    async fn connect(&self, uri: &FailoverUri) -> Result<Arc<dyn BusSession>>;
}

/// One live connection to the bus
#[async_trait]
pub trait BusSession: Send + Sync {
    async fn publish(&self, destination: &Destination, envelope: Envelope) -> Result<()>;

    /// Attach a consumer. When a selector is given, only matching
    /// envelopes are delivered to `sink`.
    async fn subscribe(
        &self,
        destination: &Destination,
        selector: Option<AddressFilter>,
        sink: EnvelopeSink,
    ) -> Result<ConsumerId>;

    async fn unsubscribe(&self, consumer: ConsumerId) -> Result<()>;

    /// Close the session. Consumers stop receiving.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}
