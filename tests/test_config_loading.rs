//! Loading broker properties from TOML files into a validated configuration

use pubsub_direct::config::{ConfigError, SecureProtocol};
use pubsub_direct::{
    Authentication, BackPressurePolicy, BrokerProperties, ConnectionManager, RetryStrategy,
    ServiceConfig,
};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn load(contents: &str) -> Result<ServiceConfig, ConfigError> {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    let props = BrokerProperties::load_from_file(file.path())?;
    ServiceConfig::from_properties(&props)
}

#[test]
fn test_full_properties_file() {
    let config = load(
        r#"
[transport]
host = "tcp://broker.example.com:1884"
connect-timeout-ms = 2500

[service]
vpn-name = "trading"
client-name = "desk-7"

[authentication]
scheme = "basic"
basic.user-name = "alice"
basic.password = "s3cret"

[reconnection]
attempts = 3
interval = 1000
wait-timeout-ms = 15000

[publisher.back-pressure]
buffer-capacity = 5
strategy = "block"
wait-timeout-ms = 250

[receiver]
delivery-queue-capacity = 16
"#,
    )
    .unwrap();

    assert_eq!(config.endpoint.host, "broker.example.com");
    assert_eq!(config.endpoint.port, 1884);
    assert!(!config.endpoint.secure);
    assert_eq!(config.vpn_name, "trading");
    assert_eq!(config.client_name, "desk-7");
    assert_eq!(
        config.authentication,
        Authentication::Basic {
            username: "alice".to_string(),
            password: "s3cret".to_string()
        }
    );
    assert_eq!(
        config.retry_strategy,
        RetryStrategy::parametrized_retry(3, Duration::from_secs(1))
    );
    assert_eq!(config.connect_timeout, Duration::from_millis(2500));
    assert_eq!(config.reconnection_wait_timeout, Duration::from_secs(15));
    assert_eq!(config.publisher.buffer_capacity, 5);
    assert_eq!(
        config.publisher.back_pressure,
        BackPressurePolicy::Block(Duration::from_millis(250))
    );
    assert_eq!(config.receiver.delivery_queue_capacity, 16);
}

#[test]
fn test_minimal_file_uses_defaults() {
    let config = load("[transport]\nhost = \"localhost\"\n").unwrap();

    assert_eq!(config.endpoint.port, 1883);
    assert_eq!(config.retry_strategy, RetryStrategy::NeverRetry);
    assert_eq!(config.authentication, Authentication::None);
    assert!(config.client_name.starts_with("pubsub-"));
    assert_eq!(config.reconnection_wait_timeout, Duration::from_secs(60));
}

#[test]
fn test_tls_section() {
    let trust_store = tempfile::tempdir().unwrap();
    let config = load(&format!(
        r#"
[transport]
host = "tcps://broker.example.com"

[transport-security]
cert-validation = true
trust-store-path = "{}"
excluded-protocols = ["SSLv3", "TLSv1"]
downgradable = true
"#,
        trust_store.path().display()
    ))
    .unwrap();

    assert!(config.endpoint.secure);
    assert_eq!(config.endpoint.port, 8883);
    let security = &config.transport_security;
    assert_eq!(security.trust_store_path.as_deref(), Some(trust_store.path()));
    assert!(security.excluded_protocols.contains(&SecureProtocol::SslV3));
    assert!(security.downgradable);
}

#[test]
fn test_missing_host_fails_before_connect() {
    let result = load("[service]\nvpn-name = \"default\"\n");
    assert!(matches!(result, Err(ConfigError::MissingProperty(key)) if key == "transport.host"));
}

#[test]
fn test_invalid_values_are_reported() {
    assert!(matches!(
        load("[transport]\nhost = \"localhost\"\n[reconnection]\nattempts = -5\n"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        load("[transport]\nhost = \"ws://localhost\"\n"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        load("[transport]\nhost = \"localhost\"\n[publisher.back-pressure]\nbuffer-capacity = 0\n"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        load("[transport]\nhost = \"localhost\"\n[receiver]\ndelivery-queue-capacity = 1000000000000\n"),
        Err(ConfigError::InvalidValue { .. })
    ));
}

#[test]
fn test_malformed_toml() {
    assert!(matches!(
        load("[transport\nhost = "),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_missing_trust_store_rejected_for_secure_endpoint() {
    let result = load(
        "[transport]\nhost = \"tcps://broker\"\n[transport-security]\ntrust-store-path = \"/nonexistent/certs\"\n",
    );
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[tokio::test]
async fn test_manager_builds_from_file_without_network() {
    let config = load("[transport]\nhost = \"tcp://127.0.0.1:1\"\n").unwrap();
    let manager = ConnectionManager::with_mqtt(config).unwrap();
    assert_eq!(manager.broker_uri(), "tcp://127.0.0.1:1");
    assert!(!manager.is_connected());
}
