//! rumqttc-backed [`Transport`]
//!
//! Each `open` builds a fresh client and event loop, waits for the CONNACK,
//! then hands the event loop to a pump task that feeds the session link.
//! Reconnection is the connection manager's job; the pump only reports that
//! the session went away.

use super::connection::{configure_mqtt_options, configure_plaintext_fallback};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{ConfigError, ServiceConfig};
use crate::message::OutboundMessage;
use crate::topic::TopicSubscription;
use crate::transport::{LinkEvent, Transport, TransportError, TransportLink, LINK_CHANNEL_CAPACITY};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop, MqttOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of rumqttc's request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `close` lets the pump flush the DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_millis(500);

struct Session {
    client: AsyncClient,
    pump: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    fn terminate(self) {
        let _ = self.shutdown.send(true);
        self.pump.abort();
    }
}

pub struct MqttTransport {
    options: MqttOptions,
    plaintext_fallback: Option<MqttOptions>,
    broker_uri: String,
    session: Mutex<Option<Session>>,
    /// Bumped by `abort` so an in-flight handshake knows to discard itself
    generation: AtomicU64,
}

impl MqttTransport {
    pub fn new(config: &ServiceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            options: configure_mqtt_options(config)?,
            plaintext_fallback: configure_plaintext_fallback(config)?,
            broker_uri: config.endpoint.uri(),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Connect and wait for the broker's CONNACK
    async fn handshake(options: MqttOptions) -> Result<(AsyncClient, EventLoop), TransportError> {
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| MessageHandler::classify_connection_error(&e))?;

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok((client, event_loop)),
                EventRoute::Disconnected(reason) => return Err(TransportError::Rejected(reason)),
                _ => continue,
            }
        }
    }

    async fn handshake_with_fallback(&self) -> Result<(AsyncClient, EventLoop), TransportError> {
        match Self::handshake(self.options.clone()).await {
            Err(TransportError::Tls(reason)) => match &self.plaintext_fallback {
                Some(plain) => {
                    warn!(broker = %self.broker_uri, error = %reason, "TLS handshake failed, downgrading to plaintext");
                    Self::handshake(plain.clone()).await
                }
                None => Err(TransportError::Tls(reason)),
            },
            other => other,
        }
    }

    async fn client(&self) -> Result<AsyncClient, TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(TransportError::NotConnected)
    }
}

/// Forward session traffic to the link until the session ends
async fn pump(
    mut event_loop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = event_loop.poll() => polled,
        };

        let event = match polled {
            Ok(event) => event,
            Err(e) => {
                if !*shutdown.borrow() {
                    let cause = MessageHandler::classify_connection_error(&e);
                    debug!(error = %e, "MQTT event loop ended");
                    let _ = events.send(LinkEvent::Dropped(cause)).await;
                }
                break;
            }
        };

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived(message) => {
                // Awaiting channel space here is what slows reads for a slow consumer
                tokio::select! {
                    _ = shutdown.changed() => break,
                    sent = events.send(LinkEvent::Inbound(message)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            EventRoute::Disconnected(reason) => {
                let _ = events
                    .send(LinkEvent::Dropped(TransportError::Closed(reason)))
                    .await;
                break;
            }
            EventRoute::Infrastructure(detail) => trace!(packet = %detail, "MQTT packet"),
            EventRoute::ConnectionAcknowledged
            | EventRoute::SubscriptionConfirmed
            | EventRoute::Outgoing => {}
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        if let Some(stale) = self.session.lock().await.take() {
            stale.terminate();
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let (client, event_loop) = self.handshake_with_fallback().await?;

        let mut session = self.session.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(TransportError::Closed("aborted during handshake".to_string()));
        }

        let (events, link) = TransportLink::channel(LINK_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(pump(event_loop, events, shutdown_rx));
        *session = Some(Session {
            client,
            pump,
            shutdown,
        });

        info!(broker = %self.broker_uri, "MQTT session established");
        Ok(link)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()));

        if tokio::time::timeout(CLOSE_GRACE, &mut session.pump)
            .await
            .is_err()
        {
            debug!("MQTT pump still running after DISCONNECT, stopping it");
        }
        session.terminate();
        result
    }

    async fn abort(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.take() {
            session.terminate();
        }
    }

    async fn subscribe(&self, subscription: &TopicSubscription) -> Result<(), TransportError> {
        self.client()
            .await?
            .subscribe(subscription.to_mqtt_filter(), QoS::AtMostOnce)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn unsubscribe(&self, subscription: &TopicSubscription) -> Result<(), TransportError> {
        self.client()
            .await?
            .unsubscribe(subscription.to_mqtt_filter())
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.client()
            .await?
            .publish_with_properties(
                message.destination.as_str(),
                QoS::AtMostOnce,
                false,
                message.message.payload().clone(),
                MessageHandler::publish_properties(message),
            )
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    fn broker_uri(&self) -> String {
        self.broker_uri.clone()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, BrokerProperties};
    use crate::message::Message;
    use crate::topic::Topic;

    fn transport(host: &str) -> MqttTransport {
        let config = ServiceConfig::from_properties(&BrokerProperties::from_pairs([
            (keys::TRANSPORT_HOST, host),
            (keys::SERVICE_CLIENT_NAME, "mqtt-transport-test"),
        ]))
        .unwrap();
        MqttTransport::new(&config).unwrap()
    }

    #[test]
    fn test_broker_uri() {
        assert_eq!(
            transport("broker.local").broker_uri(),
            "tcp://broker.local:1883"
        );
    }

    #[tokio::test]
    async fn test_operations_without_session() {
        let transport = transport("localhost");
        let subscription = TopicSubscription::of("prices/>").unwrap();
        let outbound = OutboundMessage::new(
            Topic::of("prices/eur").unwrap(),
            Message::builder().build("x"),
        );

        assert_eq!(
            transport.subscribe(&subscription).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.unsubscribe(&subscription).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.send(&outbound).await,
            Err(TransportError::NotConnected)
        );
        assert!(transport.close().await.is_ok());
        transport.abort().await;
    }

    #[tokio::test]
    async fn test_open_refused_port_is_unreachable() {
        let transport = transport("tcp://127.0.0.1:1");
        let result = tokio::time::timeout(Duration::from_secs(5), transport.open())
            .await
            .expect("refused connect should fail fast");

        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
