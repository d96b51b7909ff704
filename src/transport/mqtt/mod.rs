//! MQTT v5 binding built on rumqttc
//!
//! - [`connection`] - option setup from a [`crate::config::ServiceConfig`]
//! - [`tls`] - rustls client configuration for secure endpoints
//! - [`message_handler`] - pure event routing and packet conversion
//! - [`client`] - the I/O side, implementing [`crate::transport::Transport`]
//!
//! ```rust,no_run
//! use pubsub_direct::config::{keys, BrokerProperties, ServiceConfig};
//! use pubsub_direct::transport::{mqtt::MqttTransport, Transport};
//!
//! # tokio_test::block_on(async {
//! let props = BrokerProperties::from_pairs([(keys::TRANSPORT_HOST, "tcp://localhost:1883")]);
//! let transport = MqttTransport::new(&ServiceConfig::from_properties(&props)?)?;
//! let _link = transport.open().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod tls;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, configure_plaintext_fallback};
pub use message_handler::{EventRoute, MessageHandler};
