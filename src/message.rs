//! Message model for direct publishing and receiving

use crate::topic::Topic;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Outbound payload plus optional metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    application_message_id: Option<String>,
    properties: BTreeMap<String, String>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn application_message_id(&self) -> Option<&str> {
        self.application_message_id.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self {
        MessageBuilder::default().build(payload)
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Bytes::from(payload).into()
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Bytes::from(payload).into()
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Bytes::copy_from_slice(payload.as_bytes()).into()
    }
}

/// Builder for messages that carry an application message id or properties
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    application_message_id: Option<String>,
    properties: BTreeMap<String, String>,
}

impl MessageBuilder {
    pub fn with_application_message_id(mut self, id: impl Into<String>) -> Self {
        self.application_message_id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn build(self, payload: impl Into<Bytes>) -> Message {
        Message {
            payload: payload.into(),
            application_message_id: self.application_message_id,
            properties: self.properties,
        }
    }
}

/// A message bound for a destination, owned by the publisher buffer
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub destination: Topic,
    pub message: Message,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(destination: Topic, message: Message) -> Self {
        Self {
            destination,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub destination: String,
    pub payload: Bytes,
    pub application_message_id: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            application_message_id: None,
            properties: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_application_message_id(mut self, id: impl Into<String>) -> Self {
        self.application_message_id = Some(id.into());
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Payload as UTF-8, `None` for binary payloads
    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
