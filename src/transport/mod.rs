//! Transport layer abstraction
//!
//! The connection manager, publisher and receiver talk to the broker only
//! through [`Transport`]. The MQTT implementation lives in [`mqtt`]; tests
//! use [`crate::testing::MockTransport`].

use crate::message::{InboundMessage, OutboundMessage};
use crate::topic::TopicSubscription;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Capacity of the channel between a transport read loop and the manager
pub const LINK_CHANNEL_CAPACITY: usize = 64;

/// Transport-level failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Broker rejected the request: {0}")]
    Rejected(String),
    #[error("No active session")]
    NotConnected,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Event delivered by an open session
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Inbound(InboundMessage),
    /// The session ended without being asked to
    Dropped(TransportError),
}

/// Receiving half of an established session
///
/// The transport's read loop awaits space in the channel, so a slow consumer
/// slows down network reads instead of growing memory.
#[derive(Debug)]
pub struct TransportLink {
    events: mpsc::Receiver<LinkEvent>,
}

impl TransportLink {
    pub fn new(events: mpsc::Receiver<LinkEvent>) -> Self {
        Self { events }
    }

    /// Create a link and the sender a read loop feeds it with
    pub fn channel(capacity: usize) -> (mpsc::Sender<LinkEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    /// Next event; a closed channel reads as a dropped session
    pub async fn recv(&mut self) -> LinkEvent {
        self.events.recv().await.unwrap_or_else(|| {
            LinkEvent::Dropped(TransportError::Closed("event stream ended".to_string()))
        })
    }
}

/// Broker session operations
///
/// Implementations own at most one live session at a time. `open` replaces
/// any previous session.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the connection handshake
    async fn open(&self) -> Result<TransportLink, TransportError>;

    /// Graceful shutdown of the current session
    async fn close(&self) -> Result<(), TransportError>;

    /// Hard-terminate the current session without a goodbye
    async fn abort(&self);

    async fn subscribe(&self, subscription: &TopicSubscription) -> Result<(), TransportError>;

    async fn unsubscribe(&self, subscription: &TopicSubscription) -> Result<(), TransportError>;

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Endpoint description carried in service events
    fn broker_uri(&self) -> String;
}

pub use mqtt::MqttTransport;
