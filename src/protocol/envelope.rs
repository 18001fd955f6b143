//! Bus message envelope
//!
//! Every message on a peer channel is a small string header map plus an
//! optional body. Header names and literal values are part of the wire
//! format and must not change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Header names and literals
// ─────────────────────────────────────────────────────────────────

pub const TO_SERVER_ID: &str = "toServerId";
pub const FROM_SERVER_ID: &str = "fromServerId";
pub const FROM_SERVER_START_TIME: &str = "fromServerStartTime";
pub const PLUGIN_ID: &str = "pluginId";
pub const TYPE: &str = "type";
pub const SUBTYPE: &str = "subtype";

/// `toServerId` value addressing every peer
pub const BROADCAST: &str = "*";

/// `type` value of protocol control messages
pub const COORDINATION_TYPE: &str = "coordination";

// ─────────────────────────────────────────────────────────────────
// Message classification
// ─────────────────────────────────────────────────────────────────

/// Value of the `type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Application payload (`type` is empty)
    User,
    /// Membership protocol message
    Coordination,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "",
            MessageKind::Coordination => COORDINATION_TYPE,
        }
    }
}

/// Value of the `subtype` header on coordination messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSubtype {
    Starting,
    Discover,
    Running,
    Stopping,
    Ping,
    Pong,
}

impl ControlSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSubtype::Starting => "STARTING",
            ControlSubtype::Discover => "DISCOVER",
            ControlSubtype::Running => "RUNNING",
            ControlSubtype::Stopping => "STOPPING",
            ControlSubtype::Ping => "PING",
            ControlSubtype::Pong => "PONG",
        }
    }
}

impl fmt::Display for ControlSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlSubtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STARTING" => Ok(ControlSubtype::Starting),
            "DISCOVER" => Ok(ControlSubtype::Discover),
            "RUNNING" => Ok(ControlSubtype::Running),
            "STOPPING" => Ok(ControlSubtype::Stopping),
            "PING" => Ok(ControlSubtype::Ping),
            "PONG" => Ok(ControlSubtype::Pong),
            other => Err(Error::malformed(format!("unknown subtype '{}'", other))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Body
// ─────────────────────────────────────────────────────────────────

/// Message body. Control messages carry `Empty`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Text content, if this is a text body
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Binary(bytes)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────

/// A message plus its routing and classification headers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Body,
}

impl Envelope {
    /// Build an application message
    pub fn user(to: &str, from: &str, plugin_id: &str, body: Body) -> Self {
        let mut envelope = Self::addressed(to, from, plugin_id);
        envelope.set(TYPE, MessageKind::User.as_str());
        envelope.set(SUBTYPE, "");
        envelope.body = body;
        envelope
    }

    /// Build a protocol control message. The sender's start time rides
    /// along so receivers can order peers.
    pub fn control(
        subtype: ControlSubtype,
        to: &str,
        from: &str,
        from_start_time: i64,
        plugin_id: &str,
    ) -> Self {
        let mut envelope = Self::addressed(to, from, plugin_id);
        envelope.set(TYPE, MessageKind::Coordination.as_str());
        envelope.set(SUBTYPE, subtype.as_str());
        envelope.set(FROM_SERVER_START_TIME, from_start_time.to_string());
        envelope
    }

    fn addressed(to: &str, from: &str, plugin_id: &str) -> Self {
        let mut envelope = Self::default();
        envelope.set(TO_SERVER_ID, to);
        envelope.set(FROM_SERVER_ID, from);
        envelope.set(PLUGIN_ID, plugin_id);
        envelope
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn to_server_id(&self) -> Option<&str> {
        self.header(TO_SERVER_ID)
    }

    pub fn from_server_id(&self) -> Option<&str> {
        self.header(FROM_SERVER_ID)
    }

    pub fn plugin_id(&self) -> Option<&str> {
        self.header(PLUGIN_ID)
    }

    /// Classify by the `type` header. A missing header counts as a user
    /// message; any other value is malformed.
    pub fn kind(&self) -> Result<MessageKind> {
        match self.header(TYPE).unwrap_or("") {
            "" => Ok(MessageKind::User),
            COORDINATION_TYPE => Ok(MessageKind::Coordination),
            other => Err(Error::malformed(format!("unknown message type '{}'", other))),
        }
    }

    pub fn subtype(&self) -> Result<ControlSubtype> {
        self.header(SUBTYPE)
            .ok_or_else(|| Error::malformed("missing subtype header"))?
            .parse()
    }

    /// Sender start time in epoch milliseconds
    pub fn from_start_time(&self) -> Result<i64> {
        let raw = self
            .header(FROM_SERVER_START_TIME)
            .ok_or_else(|| Error::malformed("missing fromServerStartTime header"))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::malformed(format!("bad fromServerStartTime '{}'", raw)))
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_server_id() == Some(BROADCAST)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_envelope_headers() {
        let env = Envelope::control(ControlSubtype::Discover, "*", "node-a", 1_700_000_000_123, "acme_sync");

        assert_eq!(env.header("toServerId"), Some("*"));
        assert_eq!(env.header("fromServerId"), Some("node-a"));
        assert_eq!(env.header("pluginId"), Some("acme_sync"));
        assert_eq!(env.header("type"), Some("coordination"));
        assert_eq!(env.header("subtype"), Some("DISCOVER"));
        assert_eq!(env.header("fromServerStartTime"), Some("1700000000123"));
        assert!(env.body.is_empty());
        assert!(env.is_broadcast());
    }

    #[test]
    fn test_user_envelope_has_empty_type() {
        let env = Envelope::user("node-b", "node-a", "acme_sync", Body::from("hello"));

        assert_eq!(env.header("type"), Some(""));
        assert_eq!(env.header("subtype"), Some(""));
        assert_eq!(env.kind().unwrap(), MessageKind::User);
        assert_eq!(env.body.as_text(), Some("hello"));
        assert!(!env.is_broadcast());
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let mut env = Envelope::user("*", "a", "p", Body::Empty);
        env.set(TYPE, "gossip");
        assert!(env.kind().is_err());
    }

    #[test]
    fn test_subtype_parsing() {
        for subtype in [
            ControlSubtype::Starting,
            ControlSubtype::Discover,
            ControlSubtype::Running,
            ControlSubtype::Stopping,
            ControlSubtype::Ping,
            ControlSubtype::Pong,
        ] {
            assert_eq!(subtype.as_str().parse::<ControlSubtype>().unwrap(), subtype);
        }
        assert!("HELLO".parse::<ControlSubtype>().is_err());
    }

    #[test]
    fn test_bad_start_time() {
        let mut env = Envelope::control(ControlSubtype::Starting, "*", "a", 1, "p");
        env.set(FROM_SERVER_START_TIME, "yesterday");
        assert!(env.from_start_time().is_err());

        env.headers.remove(FROM_SERVER_START_TIME);
        assert!(env.from_start_time().is_err());
    }

    #[test]
    fn test_binary_body_is_base64_on_the_wire() {
        let env = Envelope::user("*", "a", "p", Body::Binary(vec![0, 1, 2, 255]));
        let json = env.to_json().unwrap();
        assert!(json.contains("\"kind\":\"binary\""));
        assert!(json.contains("AAEC/w=="));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_missing_body_defaults_to_empty() {
        let parsed = Envelope::from_json(r#"{"headers":{"toServerId":"*"}}"#).unwrap();
        assert!(parsed.body.is_empty());
        assert_eq!(parsed.kind().unwrap(), MessageKind::User);
    }
}
