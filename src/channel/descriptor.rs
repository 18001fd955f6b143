//! Channel descriptors and consumer callbacks

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{AddressFilter, Destination, DestinationKind, Envelope};

/// Prefix of every peer channel's destination name
pub const CHANNEL_PREFIX: &str = "peerlink_";

/// Destination name for a plugin's peer channel
pub fn channel_name(plugin_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, plugin_id)
}

/// Receives messages from a channel's consumer side
#[async_trait]
pub trait ChannelListener: Send + Sync {
    async fn on_message(&self, envelope: Envelope);

    /// Called after the channel was re-opened on a new connection
    async fn on_reopened(&self) {}
}

/// What to open when a channel is registered
#[derive(Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub kind: DestinationKind,
    pub producer: bool,
    /// Inbound predicate; applied by the transport and again on delivery
    pub filter: Option<AddressFilter>,
    /// Present when the channel has a consumer side
    pub listener: Option<Arc<dyn ChannelListener>>,
}

impl ChannelSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, DestinationKind::Topic)
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(name, DestinationKind::Queue)
    }

    fn new(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            producer: false,
            filter: None,
            listener: None,
        }
    }

    /// The addressed peer channel used by the coordinator: a topic named
    /// after the plugin, with a producer and a consumer filtered to this server.
    pub fn peer(plugin_id: &str, server_id: &str, listener: Arc<dyn ChannelListener>) -> Self {
        Self::topic(channel_name(plugin_id))
            .with_producer()
            .with_consumer(Some(AddressFilter::new(plugin_id, server_id)), listener)
    }

    pub fn with_producer(mut self) -> Self {
        self.producer = true;
        self
    }

    pub fn with_consumer(
        mut self,
        filter: Option<AddressFilter>,
        listener: Arc<dyn ChannelListener>,
    ) -> Self {
        self.filter = filter;
        self.listener = Some(listener);
        self
    }

    pub fn has_consumer(&self) -> bool {
        self.listener.is_some()
    }

    pub fn destination(&self) -> Destination {
        Destination {
            name: self.name.clone(),
            kind: self.kind,
        }
    }
}

impl fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("producer", &self.producer)
            .field("consumer", &self.has_consumer())
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    #[async_trait]
    impl ChannelListener for Quiet {
        async fn on_message(&self, _envelope: Envelope) {}
    }

    #[test]
    fn test_peer_channel_shape() {
        let spec = ChannelSpec::peer("acme_sync", "node-a", Arc::new(Quiet));

        assert_eq!(spec.name, "peerlink_acme_sync");
        assert_eq!(spec.kind, DestinationKind::Topic);
        assert!(spec.producer);
        assert!(spec.has_consumer());
        assert_eq!(spec.filter, Some(AddressFilter::new("acme_sync", "node-a")));
    }

    #[test]
    fn test_producer_only_queue() {
        let spec = ChannelSpec::queue("jobs").with_producer();
        assert!(!spec.has_consumer());
        assert_eq!(spec.destination(), Destination::queue("jobs"));
        assert!(format!("{:?}", spec).contains("consumer: false"));
    }
}
