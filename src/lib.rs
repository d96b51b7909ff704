//! Resilient direct-messaging client for a topic-based pub/sub broker
//!
//! # Overview
//!
//! - [`connection::ConnectionManager`] owns the broker session, its state
//!   machine and automatic reconnection under a [`retry::RetryStrategy`]
//! - [`events`] fans lifecycle notifications out to isolated listeners
//! - [`publisher::DirectPublisher`] sends fire-and-forget messages through a
//!   bounded [`publisher::BackpressureBuffer`]
//! - [`receiver::DirectReceiver`] delivers messages for a set of topic
//!   subscriptions that survive reconnects
//!
//! The broker is reached through the [`transport::Transport`] trait. MQTT v5
//! is the shipped binding; [`testing::MockTransport`] drives everything in
//! memory.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pubsub_direct::{
//!     BrokerProperties, ConnectionManager, Message, PublisherConfig, ReceiverConfig,
//!     ServiceConfig, Topic, TopicSubscription,
//! };
//!
//! # tokio_test::block_on(async {
//! let props = BrokerProperties::load_from_file("broker.toml".as_ref())?;
//! let manager = ConnectionManager::with_mqtt(ServiceConfig::from_properties(&props)?)?;
//! manager.connect().await?;
//!
//! let receiver = manager.create_direct_receiver(
//!     ReceiverConfig::default(),
//!     [TopicSubscription::of("prices/>")?],
//! )?;
//! receiver.receive_async(|message: pubsub_direct::InboundMessage| {
//!     println!("{}: {:?}", message.destination(), message.payload_as_str());
//! });
//! receiver.start().await?;
//!
//! let publisher = manager.create_direct_publisher(PublisherConfig::default())?;
//! publisher.start().await?;
//! publisher
//!     .publish(&Topic::of("prices/eur/usd")?, Message::builder().build("1.0842"))
//!     .await;
//!
//! manager.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod message;
pub mod observability;
pub mod publisher;
pub mod receiver;
pub mod retry;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::{
    Authentication, BrokerEndpoint, BrokerProperties, ConfigError, PublisherConfig,
    ReceiverConfig, SecureProtocol, ServiceConfig, TransportSecurity,
};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ClientError, ClientResult, ConnectError};
pub use events::{listener_fn, ListenerError, ListenerRole, ServiceEvent, ServiceListener};
pub use message::{InboundMessage, Message, OutboundMessage};
pub use publisher::{
    BackPressurePolicy, DirectPublisher, FailedPublishEvent, PublishFailureCause,
    PublishFailureListener, PublishOutcome,
};
pub use receiver::{DirectReceiver, MessageHandler, ReceiverState};
pub use retry::RetryStrategy;
pub use topic::{Topic, TopicSubscription};
pub use transport::{Transport, TransportError};
