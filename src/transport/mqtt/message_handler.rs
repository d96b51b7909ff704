//! Pure MQTT event routing and packet conversion
//!
//! Nothing here touches the network. The client feeds rumqttc events in and
//! acts on the returned [`EventRoute`].

use crate::message::{InboundMessage, OutboundMessage};
use crate::transport::TransportError;
use chrono::Utc;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, Publish, PublishProperties};
use rumqttc::v5::{ConnectionError, Event};
use std::collections::BTreeMap;

/// User property that carries the application message id
pub const APPLICATION_MESSAGE_ID_PROPERTY: &str = "application-message-id";

/// What the client should do with one event-loop event
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(InboundMessage),
    /// Broker-initiated disconnect
    Disconnected(String),
    SubscriptionConfirmed,
    /// Ping responses, acks and the like
    Infrastructure(String),
    Outgoing,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(Self::inbound(publish)),
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(_) => EventRoute::SubscriptionConfirmed,
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::Outgoing,
        }
    }

    /// Inbound message from a PUBLISH packet
    pub fn inbound(publish: &Publish) -> InboundMessage {
        let mut properties = BTreeMap::new();
        let mut application_message_id = None;

        if let Some(props) = &publish.properties {
            for (key, value) in &props.user_properties {
                if key == APPLICATION_MESSAGE_ID_PROPERTY {
                    application_message_id = Some(value.clone());
                } else {
                    properties.insert(key.clone(), value.clone());
                }
            }
        }

        InboundMessage {
            destination: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.clone(),
            application_message_id,
            properties,
            received_at: Utc::now(),
        }
    }

    /// PUBLISH properties for an outbound message
    pub fn publish_properties(outbound: &OutboundMessage) -> PublishProperties {
        let message = &outbound.message;
        let mut user_properties: Vec<(String, String)> = message
            .properties()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(id) = message.application_message_id() {
            user_properties.push((APPLICATION_MESSAGE_ID_PROPERTY.to_string(), id.to_string()));
        }

        PublishProperties {
            user_properties,
            ..Default::default()
        }
    }

    /// Map an event-loop failure onto the transport error taxonomy
    pub fn classify_connection_error(error: &ConnectionError) -> TransportError {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::classify_refusal(*code),
            ConnectionError::Io(e) => TransportError::Unreachable(e.to_string()),
            ConnectionError::Tls(e) => TransportError::Tls(e.to_string()),
            other => TransportError::Unreachable(other.to_string()),
        }
    }

    pub fn classify_refusal(code: ConnectReturnCode) -> TransportError {
        match code {
            ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::BadAuthenticationMethod
            | ConnectReturnCode::Banned => {
                TransportError::AuthenticationFailed(format!("{code:?}"))
            }
            ConnectReturnCode::ServerUnavailable
            | ConnectReturnCode::ServerBusy
            | ConnectReturnCode::UseAnotherServer
            | ConnectReturnCode::ServerMoved
            | ConnectReturnCode::ConnectionRateExceeded => {
                TransportError::Unreachable(format!("{code:?}"))
            }
            other => TransportError::Rejected(format!("{other:?}")),
        }
    }
}
