//! MQTT option construction
//!
//! Pure mapping from [`ServiceConfig`] onto rumqttc v5 options. TLS material
//! is read from disk here so configuration problems surface before connect.

use super::tls;
use crate::config::{Authentication, ConfigError, ServiceConfig, TransportSecurity};
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::sync::Arc;
use std::time::Duration;

/// User property carrying the message VPN on CONNECT
pub const VPN_NAME_PROPERTY: &str = "vpn-name";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const MAX_PACKET_SIZE: u32 = 256 * 1024;
const DEFAULT_PLAIN_PORT: u16 = 1883;
const DEFAULT_SECURE_PORT: u16 = 8883;

/// Options for the configured endpoint
pub fn configure_mqtt_options(config: &ServiceConfig) -> Result<MqttOptions, ConfigError> {
    let endpoint = &config.endpoint;
    let mut options = MqttOptions::new(
        config.client_name.clone(),
        endpoint.host.clone(),
        endpoint.port,
    );

    if let Authentication::Basic { username, password } = &config.authentication {
        options.set_credentials(username.clone(), password.clone());
    }

    options.set_keep_alive(KEEP_ALIVE);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    options.set_user_properties(vec![(
        VPN_NAME_PROPERTY.to_string(),
        config.vpn_name.clone(),
    )]);

    if endpoint.secure {
        options.set_transport(tls_transport(&config.transport_security)?);
    }

    Ok(options)
}

/// Plaintext options used when a downgradable TLS handshake fails
pub fn configure_plaintext_fallback(
    config: &ServiceConfig,
) -> Result<Option<MqttOptions>, ConfigError> {
    if !config.endpoint.secure || !config.transport_security.downgradable {
        return Ok(None);
    }

    let mut plain = config.clone();
    plain.endpoint.secure = false;
    plain.endpoint.scheme = "tcp".to_string();
    if plain.endpoint.port == DEFAULT_SECURE_PORT {
        plain.endpoint.port = DEFAULT_PLAIN_PORT;
    }
    configure_mqtt_options(&plain).map(Some)
}

fn tls_transport(security: &TransportSecurity) -> Result<RumqttcTransport, ConfigError> {
    let config = tls::client_config(security)?;
    Ok(RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(
        Arc::new(config),
    )))
}
