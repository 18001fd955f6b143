//! Boundary types of the storage-backed exchange channel
//!
//! Some deployments also coordinate through a shared content store instead
//! of the bus. That channel is not implemented here; these types describe
//! the header it exchanges and the callbacks it drives, so a host that runs
//! both transports can hand messages across.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::envelope::{Body, Envelope};

/// Payload class carried by an exchange header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Empty,
    Binary,
    Json,
}

/// Header written alongside each exchanged file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeHeader {
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub from_plugin: String,
    pub from_server: String,
    pub to_plugin: String,
    pub to_server: String,
}

impl ExchangeHeader {
    /// Describe a bus envelope for the exchange channel, returning the
    /// header and the raw content bytes.
    pub fn from_envelope(envelope: &Envelope) -> Result<(Self, Vec<u8>)> {
        let plugin = envelope
            .plugin_id()
            .ok_or_else(|| Error::malformed("envelope has no pluginId"))?
            .to_string();
        let from = envelope
            .from_server_id()
            .ok_or_else(|| Error::malformed("envelope has no fromServerId"))?
            .to_string();
        let to = envelope
            .to_server_id()
            .ok_or_else(|| Error::malformed("envelope has no toServerId"))?
            .to_string();

        let (content_type, mime_type, bytes) = match &envelope.body {
            Body::Empty => (ContentType::Empty, None, Vec::new()),
            Body::Text(text) => (
                ContentType::Binary,
                Some("text/plain; charset=utf-8".to_string()),
                text.as_bytes().to_vec(),
            ),
            Body::Binary(bytes) => (
                ContentType::Binary,
                Some("application/octet-stream".to_string()),
                bytes.clone(),
            ),
            Body::Json(value) => (
                ContentType::Json,
                Some("application/json".to_string()),
                serde_json::to_vec(value)?,
            ),
        };

        let header = Self {
            content_type,
            canonical_class_name: None,
            mime_type,
            from_plugin: plugin.clone(),
            from_server: from,
            to_plugin: plugin,
            to_server: to,
        };
        Ok((header, bytes))
    }

    /// Rebuild a body from exchanged content
    pub fn decode_body(&self, content: &[u8]) -> Result<Body> {
        match self.content_type {
            ContentType::Empty => Ok(Body::Empty),
            ContentType::Json => Ok(Body::Json(serde_json::from_slice(content)?)),
            ContentType::Binary => {
                let is_text = self
                    .mime_type
                    .as_deref()
                    .map(|m| m.starts_with("text/"))
                    .unwrap_or(false);
                if is_text {
                    String::from_utf8(content.to_vec())
                        .map(Body::Text)
                        .map_err(|e| Error::malformed(format!("text content is not UTF-8: {}", e)))
                } else {
                    Ok(Body::Binary(content.to_vec()))
                }
            }
        }
    }
}

/// Sending side of the exchange channel
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Returns false when the message could not be written
    async fn send_message(&self, header: &ExchangeHeader, content: &[u8]) -> bool;
}

/// Receiving side of the exchange channel, implemented by its owner
#[async_trait]
pub trait ExchangeHandler: Send + Sync {
    /// Called first with the header alone. Returning true means the message
    /// was fully handled and its content will not be fetched.
    async fn on_header(&self, header: &ExchangeHeader) -> bool;

    /// Called with the content when `on_header` returned false
    async fn on_content(&self, header: &ExchangeHeader, content: Vec<u8>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_header_json_field_names() {
        let env = Envelope::user("node-b", "node-a", "acme_sync", Body::Json(serde_json::json!({"k": 1})));
        let (header, bytes) = ExchangeHeader::from_envelope(&env).unwrap();
        let json = serde_json::to_string(&header).unwrap();

        assert!(json.contains("\"contentType\":\"JSON\""));
        assert!(json.contains("\"fromPlugin\":\"acme_sync\""));
        assert!(json.contains("\"toServer\":\"node-b\""));
        assert!(!json.contains("canonicalClassName"));
        assert_eq!(header.decode_body(&bytes).unwrap(), env.body);
    }

    #[test]
    fn test_text_travels_as_binary_with_text_mime() {
        let env = Envelope::user("*", "node-a", "acme_sync", Body::from("hello"));
        let (header, bytes) = ExchangeHeader::from_envelope(&env).unwrap();

        assert_eq!(header.content_type, ContentType::Binary);
        assert_eq!(bytes, b"hello");
        assert_eq!(header.decode_body(&bytes).unwrap(), Body::from("hello"));
    }

    #[test]
    fn test_envelope_without_addressing_is_rejected() {
        let mut env = Envelope::user("*", "node-a", "acme_sync", Body::Empty);
        env.headers.remove("pluginId");
        assert!(ExchangeHeader::from_envelope(&env).is_err());
    }

    struct Recorder {
        handled: bool,
        contents: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ExchangeHandler for Recorder {
        async fn on_header(&self, _header: &ExchangeHeader) -> bool {
            self.handled
        }

        async fn on_content(&self, _header: &ExchangeHeader, content: Vec<u8>) {
            self.contents.lock().push(content);
        }
    }

    #[tokio::test]
    async fn test_handler_contract() {
        let env = Envelope::user("*", "node-a", "acme_sync", Body::Binary(vec![9, 9]));
        let (header, bytes) = ExchangeHeader::from_envelope(&env).unwrap();
        let recorder = Recorder { handled: false, contents: Mutex::new(Vec::new()) };

        if !recorder.on_header(&header).await {
            recorder.on_content(&header, bytes).await;
        }
        assert_eq!(recorder.contents.lock().as_slice(), &[vec![9, 9]]);
    }
}
