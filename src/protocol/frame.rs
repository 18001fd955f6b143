//! Wire frames exchanged between a bus client and the relay broker
//!
//! Frames are JSON text messages over WebSocket, discriminated by `op`.

use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::envelope::{Envelope, BROADCAST};

// ─────────────────────────────────────────────────────────────────
// Destinations
// ─────────────────────────────────────────────────────────────────

/// Delivery semantics of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Every matching consumer receives each message
    Topic,
    /// One matching consumer receives each message
    Queue,
}

/// A named publish/subscribe destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Address filter
// ─────────────────────────────────────────────────────────────────

/// Consumer-side selector: the plugin must match, and the message must be
/// a broadcast or addressed to this server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFilter {
    pub plugin_id: String,
    pub server_id: String,
}

impl AddressFilter {
    pub fn new(plugin_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            server_id: server_id.into(),
        }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if envelope.plugin_id() != Some(self.plugin_id.as_str()) {
            return false;
        }
        match envelope.to_server_id() {
            Some(to) => to == BROADCAST || to == self.server_id,
            None => false,
        }
    }

    /// Selector expression, for logs
    pub fn expression(&self) -> String {
        format!(
            "pluginId = '{}' AND ( toServerId = '*' OR toServerId = '{}' )",
            self.plugin_id, self.server_id
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────

/// Client <-> relay frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusFrame {
    /// Client registers a consumer
    Subscribe {
        consumer: u64,
        destination: Destination,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<AddressFilter>,
    },

    /// Client drops a consumer
    Unsubscribe { consumer: u64 },

    /// Client publishes to a destination
    Publish {
        destination: Destination,
        envelope: Envelope,
    },

    /// Relay delivers a message to one of the client's consumers
    Deliver { consumer: u64, envelope: Envelope },

    /// Relay reports a problem with a client frame
    Error { message: String },
}

impl BusFrame {
    pub fn op_name(&self) -> &'static str {
        match self {
            BusFrame::Subscribe { .. } => "subscribe",
            BusFrame::Unsubscribe { .. } => "unsubscribe",
            BusFrame::Publish { .. } => "publish",
            BusFrame::Deliver { .. } => "deliver",
            BusFrame::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
