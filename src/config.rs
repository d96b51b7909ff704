//! Broker properties and validated service configuration
//!
//! Callers hand the runtime a flat map of string keys to values
//! ([`BrokerProperties`]). [`ServiceConfig::from_properties`] turns that map
//! into typed, validated configuration before any network activity happens,
//! so a missing or malformed property fails at build time rather than at
//! connect time.
//!
//! Properties can also be loaded from a TOML file. Tables are flattened into
//! dotted keys, so
//!
//! ```toml
//! [transport]
//! host = "tcp://localhost:1883"
//!
//! [reconnection]
//! attempts = 20
//! interval = 3000
//! ```
//!
//! yields `transport.host`, `reconnection.attempts` and `reconnection.interval`.

use crate::publisher::BackPressurePolicy;
use crate::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Recognized property keys
pub mod keys {
    pub const TRANSPORT_HOST: &str = "transport.host";
    pub const TRANSPORT_CONNECT_TIMEOUT_MS: &str = "transport.connect-timeout-ms";

    pub const SERVICE_VPN_NAME: &str = "service.vpn-name";
    pub const SERVICE_CLIENT_NAME: &str = "service.client-name";

    pub const AUTHENTICATION_SCHEME: &str = "authentication.scheme";
    pub const AUTHENTICATION_BASIC_USER_NAME: &str = "authentication.basic.user-name";
    pub const AUTHENTICATION_BASIC_PASSWORD: &str = "authentication.basic.password";

    pub const RECONNECTION_ATTEMPTS: &str = "reconnection.attempts";
    pub const RECONNECTION_INTERVAL_MS: &str = "reconnection.interval";
    pub const RECONNECTION_WAIT_TIMEOUT_MS: &str = "reconnection.wait-timeout-ms";

    pub const TLS_CERT_VALIDATION: &str = "transport-security.cert-validation";
    pub const TLS_CERT_IGNORE_EXPIRATION: &str = "transport-security.cert-ignore-expiration";
    pub const TLS_TRUST_STORE_PATH: &str = "transport-security.trust-store-path";
    pub const TLS_EXCLUDED_PROTOCOLS: &str = "transport-security.excluded-protocols";
    pub const TLS_CIPHER_SUITES: &str = "transport-security.cipher-suites";
    pub const TLS_DOWNGRADABLE: &str = "transport-security.downgradable";

    pub const PUBLISHER_BUFFER_CAPACITY: &str = "publisher.back-pressure.buffer-capacity";
    pub const PUBLISHER_BACK_PRESSURE_STRATEGY: &str = "publisher.back-pressure.strategy";
    pub const PUBLISHER_BACK_PRESSURE_WAIT_MS: &str = "publisher.back-pressure.wait-timeout-ms";
    pub const PUBLISHER_SEND_RETRIES: &str = "publisher.send-retries";
    pub const PUBLISHER_SEND_RETRY_INTERVAL_MS: &str = "publisher.send-retry-interval-ms";

    pub const RECEIVER_DELIVERY_QUEUE_CAPACITY: &str = "receiver.delivery-queue-capacity";

    pub const LISTENER_DISPATCH_TIMEOUT_MS: &str = "listener.dispatch-timeout-ms";
}

const DEFAULT_VPN_NAME: &str = "default";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECTION_WAIT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_LISTENER_DISPATCH_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_BUFFER_CAPACITY: usize = 50;
const DEFAULT_BACK_PRESSURE_WAIT_MS: u64 = 1_000;
const DEFAULT_SEND_RETRIES: u32 = 3;
const DEFAULT_SEND_RETRY_INTERVAL_MS: u64 = 100;
const DEFAULT_DELIVERY_QUEUE_CAPACITY: usize = 256;

/// Largest accepted publisher buffer or receiver delivery queue capacity
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read properties file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required property: {0}")]
    MissingProperty(String),
    #[error("Invalid value '{value}' for property {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    fn invalid_value(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Immutable flat mapping of configuration keys to values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerProperties {
    entries: BTreeMap<String, String>,
}

impl BrokerProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Return a copy with one more entry (later values win)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Parse TOML text, flattening nested tables into dotted keys
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content)?;
        let mut entries = BTreeMap::new();
        for (key, value) in &table {
            flatten_toml(key, value, &mut entries);
        }
        Ok(Self { entries })
    }

    /// Load properties from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get_str(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::invalid_value(key, raw, "expected a boolean")),
            })
            .transpose()
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get_str(key)
            .map(|raw| {
                raw.parse::<u64>().map_err(|e| {
                    ConfigError::invalid_value(key, raw, format!("expected an unsigned integer: {e}"))
                })
            })
            .transpose()
    }

    /// Queue capacity in `1..=MAX_QUEUE_CAPACITY`
    pub fn get_capacity(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        let Some(value) = self.get_u64(key)? else {
            return Ok(None);
        };
        match usize::try_from(value) {
            Ok(capacity) if (1..=MAX_QUEUE_CAPACITY).contains(&capacity) => Ok(Some(capacity)),
            _ => Err(ConfigError::invalid_value(
                key,
                &value.to_string(),
                format!("expected a capacity between 1 and {MAX_QUEUE_CAPACITY}"),
            )),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        self.get_str(key)
            .map(|raw| {
                raw.parse::<i64>().map_err(|e| {
                    ConfigError::invalid_value(key, raw, format!("expected an integer: {e}"))
                })
            })
            .transpose()
    }

    /// Comma separated list; blank items are dropped
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_str(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.get_u64(key)?.map(Duration::from_millis))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BrokerProperties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (key, nested) in table {
                flatten_toml(&format!("{prefix}.{key}"), nested, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        toml::Value::Array(items) => {
            let joined = items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",");
            out.insert(prefix.to_string(), joined);
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl BrokerEndpoint {
    /// Parse `scheme://host[:port]` or a bare `host[:port]` (plain TCP)
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("tcp://{raw}")
        };

        let url = Url::parse(&candidate).map_err(|e| {
            ConfigError::invalid_value(keys::TRANSPORT_HOST, raw, format!("malformed URL: {e}"))
        })?;

        let secure = match url.scheme() {
            "tcp" | "mqtt" => false,
            "tcps" | "mqtts" | "ssl" => true,
            other => {
                return Err(ConfigError::invalid_value(
                    keys::TRANSPORT_HOST,
                    raw,
                    format!("unsupported scheme '{other}'"),
                ))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::invalid_value(keys::TRANSPORT_HOST, raw, "missing host"))?
            .to_string();
        let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
            secure,
        })
    }

    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Credential scheme
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    None,
    Basic { username: String, password: String },
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::None => f.write_str("None"),
            Authentication::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

impl Authentication {
    fn from_properties(props: &BrokerProperties) -> Result<Self, ConfigError> {
        let username = props.get_str(keys::AUTHENTICATION_BASIC_USER_NAME);
        let scheme = props
            .get_str(keys::AUTHENTICATION_SCHEME)
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| {
                if username.is_some() {
                    "basic".to_string()
                } else {
                    "none".to_string()
                }
            });

        match scheme.as_str() {
            "none" => Ok(Authentication::None),
            "basic" => {
                let username = username.ok_or_else(|| {
                    ConfigError::MissingProperty(keys::AUTHENTICATION_BASIC_USER_NAME.to_string())
                })?;
                Ok(Authentication::Basic {
                    username: username.to_string(),
                    password: props
                        .get_str(keys::AUTHENTICATION_BASIC_PASSWORD)
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            other => Err(ConfigError::invalid_value(
                keys::AUTHENTICATION_SCHEME,
                other,
                "expected 'basic' or 'none'",
            )),
        }
    }
}

/// TLS protocol versions that may be excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecureProtocol {
    SslV3,
    TlsV1,
    TlsV1_1,
    TlsV1_2,
    TlsV1_3,
}

impl SecureProtocol {
    pub const ALL: [SecureProtocol; 5] = [
        SecureProtocol::SslV3,
        SecureProtocol::TlsV1,
        SecureProtocol::TlsV1_1,
        SecureProtocol::TlsV1_2,
        SecureProtocol::TlsV1_3,
    ];

    /// Versions that modern TLS stacks still negotiate
    pub fn is_modern(self) -> bool {
        matches!(self, SecureProtocol::TlsV1_2 | SecureProtocol::TlsV1_3)
    }
}

impl FromStr for SecureProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sslv3" => Ok(SecureProtocol::SslV3),
            "tlsv1" | "tlsv1.0" => Ok(SecureProtocol::TlsV1),
            "tlsv1.1" => Ok(SecureProtocol::TlsV1_1),
            "tlsv1.2" => Ok(SecureProtocol::TlsV1_2),
            "tlsv1.3" => Ok(SecureProtocol::TlsV1_3),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

impl fmt::Display for SecureProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecureProtocol::SslV3 => "SSLv3",
            SecureProtocol::TlsV1 => "TLSv1",
            SecureProtocol::TlsV1_1 => "TLSv1.1",
            SecureProtocol::TlsV1_2 => "TLSv1.2",
            SecureProtocol::TlsV1_3 => "TLSv1.3",
        };
        f.write_str(name)
    }
}

/// Transport security options, applied when the endpoint scheme is secure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSecurity {
    pub certificate_validation: bool,
    pub ignore_expiration: bool,
    pub trust_store_path: Option<PathBuf>,
    pub excluded_protocols: Vec<SecureProtocol>,
    pub cipher_suites: Vec<String>,
    pub downgradable: bool,
}

impl Default for TransportSecurity {
    fn default() -> Self {
        Self {
            certificate_validation: true,
            ignore_expiration: false,
            trust_store_path: None,
            excluded_protocols: Vec::new(),
            cipher_suites: Vec::new(),
            downgradable: false,
        }
    }
}

impl TransportSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate_validation(
        mut self,
        ignore_expiration: bool,
        trust_store_path: impl Into<PathBuf>,
    ) -> Self {
        self.certificate_validation = true;
        self.ignore_expiration = ignore_expiration;
        self.trust_store_path = Some(trust_store_path.into());
        self
    }

    pub fn without_certificate_validation(mut self) -> Self {
        self.certificate_validation = false;
        self
    }

    pub fn with_excluded_protocols(mut self, protocols: &[SecureProtocol]) -> Self {
        for protocol in protocols {
            if !self.excluded_protocols.contains(protocol) {
                self.excluded_protocols.push(*protocol);
            }
        }
        self
    }

    pub fn with_cipher_suites(mut self, suites: &str) -> Self {
        self.cipher_suites = suites
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    pub fn downgradable(mut self) -> Self {
        self.downgradable = true;
        self
    }

    fn from_properties(props: &BrokerProperties) -> Result<Self, ConfigError> {
        let mut security = TransportSecurity {
            certificate_validation: props.get_bool(keys::TLS_CERT_VALIDATION)?.unwrap_or(true),
            ignore_expiration: props
                .get_bool(keys::TLS_CERT_IGNORE_EXPIRATION)?
                .unwrap_or(false),
            trust_store_path: props.get_str(keys::TLS_TRUST_STORE_PATH).map(PathBuf::from),
            excluded_protocols: Vec::new(),
            cipher_suites: props.get_list(keys::TLS_CIPHER_SUITES),
            downgradable: props.get_bool(keys::TLS_DOWNGRADABLE)?.unwrap_or(false),
        };

        for name in props.get_list(keys::TLS_EXCLUDED_PROTOCOLS) {
            let protocol = name.parse::<SecureProtocol>().map_err(|reason| {
                ConfigError::invalid_value(keys::TLS_EXCLUDED_PROTOCOLS, &name, reason)
            })?;
            security = security.with_excluded_protocols(&[protocol]);
        }

        Ok(security)
    }

    /// Validate options without touching the network
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.trust_store_path {
            if !path.exists() {
                return Err(ConfigError::invalid_value(
                    keys::TLS_TRUST_STORE_PATH,
                    &path.display().to_string(),
                    "trust store path does not exist",
                ));
            }
        }

        if SecureProtocol::ALL
            .iter()
            .filter(|p| p.is_modern())
            .all(|p| self.excluded_protocols.contains(p))
        {
            return Err(ConfigError::InvalidConfig(
                "TLSv1.2 and TLSv1.3 are both excluded".to_string(),
            ));
        }

        Ok(())
    }
}

/// Direct publisher settings
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub buffer_capacity: usize,
    pub back_pressure: BackPressurePolicy,
    pub send_retries: u32,
    pub send_retry_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            back_pressure: BackPressurePolicy::Reject,
            send_retries: DEFAULT_SEND_RETRIES,
            send_retry_interval: Duration::from_millis(DEFAULT_SEND_RETRY_INTERVAL_MS),
        }
    }
}

impl PublisherConfig {
    /// Reject submissions immediately once `buffer_capacity` messages are buffered
    pub fn on_back_pressure_reject(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            back_pressure: BackPressurePolicy::Reject,
            ..Default::default()
        }
    }

    /// Wait up to `timeout` for buffer space before rejecting
    pub fn on_back_pressure_wait(buffer_capacity: usize, timeout: Duration) -> Self {
        Self {
            buffer_capacity,
            back_pressure: BackPressurePolicy::Block(timeout),
            ..Default::default()
        }
    }

    pub fn with_send_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.send_retries = retries;
        self.send_retry_interval = interval;
        self
    }

    fn from_properties(props: &BrokerProperties) -> Result<Self, ConfigError> {
        let buffer_capacity = props
            .get_capacity(keys::PUBLISHER_BUFFER_CAPACITY)?
            .unwrap_or(DEFAULT_BUFFER_CAPACITY);
        let wait = props
            .get_millis(keys::PUBLISHER_BACK_PRESSURE_WAIT_MS)?
            .unwrap_or(Duration::from_millis(DEFAULT_BACK_PRESSURE_WAIT_MS));

        let back_pressure = match props
            .get_str(keys::PUBLISHER_BACK_PRESSURE_STRATEGY)
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            None | Some("reject") => BackPressurePolicy::Reject,
            Some("block") | Some("wait") => BackPressurePolicy::Block(wait),
            Some(other) => {
                return Err(ConfigError::invalid_value(
                    keys::PUBLISHER_BACK_PRESSURE_STRATEGY,
                    other,
                    "expected 'reject' or 'block'",
                ))
            }
        };

        Ok(Self {
            buffer_capacity,
            back_pressure,
            send_retries: props
                .get_u64(keys::PUBLISHER_SEND_RETRIES)?
                .map(|r| r.min(u32::MAX as u64) as u32)
                .unwrap_or(DEFAULT_SEND_RETRIES),
            send_retry_interval: props
                .get_millis(keys::PUBLISHER_SEND_RETRY_INTERVAL_MS)?
                .unwrap_or(Duration::from_millis(DEFAULT_SEND_RETRY_INTERVAL_MS)),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_QUEUE_CAPACITY).contains(&self.buffer_capacity) {
            return Err(ConfigError::InvalidConfig(format!(
                "publisher buffer capacity must be between 1 and {MAX_QUEUE_CAPACITY}, got {}",
                self.buffer_capacity
            )));
        }
        Ok(())
    }
}

/// Direct receiver settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub delivery_queue_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            delivery_queue_capacity: DEFAULT_DELIVERY_QUEUE_CAPACITY,
        }
    }
}

impl ReceiverConfig {
    pub fn with_delivery_queue_capacity(capacity: usize) -> Self {
        Self {
            delivery_queue_capacity: capacity,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_QUEUE_CAPACITY).contains(&self.delivery_queue_capacity) {
            return Err(ConfigError::InvalidConfig(format!(
                "receiver delivery queue capacity must be between 1 and {MAX_QUEUE_CAPACITY}, got {}",
                self.delivery_queue_capacity
            )));
        }
        Ok(())
    }
}

/// Validated configuration for a [`crate::connection::ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub endpoint: BrokerEndpoint,
    pub vpn_name: String,
    pub client_name: String,
    pub authentication: Authentication,
    pub transport_security: TransportSecurity,
    pub retry_strategy: RetryStrategy,
    pub connect_timeout: Duration,
    pub reconnection_wait_timeout: Duration,
    pub listener_dispatch_timeout: Duration,
    pub publisher: PublisherConfig,
    pub receiver: ReceiverConfig,
}

impl ServiceConfig {
    /// Build and validate configuration from broker properties
    pub fn from_properties(props: &BrokerProperties) -> Result<Self, ConfigError> {
        let host = props
            .get_str(keys::TRANSPORT_HOST)
            .ok_or_else(|| ConfigError::MissingProperty(keys::TRANSPORT_HOST.to_string()))?;

        let config = ServiceConfig {
            endpoint: BrokerEndpoint::parse(host)?,
            vpn_name: props
                .get_str(keys::SERVICE_VPN_NAME)
                .unwrap_or(DEFAULT_VPN_NAME)
                .to_string(),
            client_name: props
                .get_str(keys::SERVICE_CLIENT_NAME)
                .map(str::to_string)
                .unwrap_or_else(generate_client_name),
            authentication: Authentication::from_properties(props)?,
            transport_security: TransportSecurity::from_properties(props)?,
            retry_strategy: RetryStrategy::from_properties(props)?.unwrap_or_default(),
            connect_timeout: props
                .get_millis(keys::TRANSPORT_CONNECT_TIMEOUT_MS)?
                .unwrap_or(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)),
            reconnection_wait_timeout: props
                .get_millis(keys::RECONNECTION_WAIT_TIMEOUT_MS)?
                .unwrap_or(Duration::from_millis(DEFAULT_RECONNECTION_WAIT_TIMEOUT_MS)),
            listener_dispatch_timeout: props
                .get_millis(keys::LISTENER_DISPATCH_TIMEOUT_MS)?
                .unwrap_or(Duration::from_millis(DEFAULT_LISTENER_DISPATCH_TIMEOUT_MS)),
            publisher: PublisherConfig::from_properties(props)?,
            receiver: ReceiverConfig {
                delivery_queue_capacity: props
                    .get_capacity(keys::RECEIVER_DELIVERY_QUEUE_CAPACITY)?
                    .unwrap_or(DEFAULT_DELIVERY_QUEUE_CAPACITY),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Explicit strategy, taking precedence over `reconnection.*` properties
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_transport_security(mut self, security: TransportSecurity) -> Self {
        self.transport_security = security;
        self
    }

    pub fn with_reconnection_wait_timeout(mut self, timeout: Duration) -> Self {
        self.reconnection_wait_timeout = timeout;
        self
    }

    pub fn with_listener_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.listener_dispatch_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry_strategy.validate()?;
        self.publisher.validate()?;
        self.receiver.validate()?;
        if self.endpoint.secure {
            self.transport_security.validate()?;
        }

        for (name, value) in [
            ("connect timeout", self.connect_timeout),
            ("listener dispatch timeout", self.listener_dispatch_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.client_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn generate_client_name() -> String {
    format!("pubsub-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_properties() -> BrokerProperties {
        BrokerProperties::from_pairs([(keys::TRANSPORT_HOST, "tcp://localhost:1883")])
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = ServiceConfig::from_properties(&minimal_properties()).unwrap();

        assert_eq!(config.endpoint.host, "localhost");
        assert_eq!(config.endpoint.port, 1883);
        assert!(!config.endpoint.secure);
        assert_eq!(config.vpn_name, "default");
        assert!(config.client_name.starts_with("pubsub-"));
        assert_eq!(config.authentication, Authentication::None);
        assert_eq!(config.retry_strategy, RetryStrategy::NeverRetry);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnection_wait_timeout, Duration::from_secs(60));
        assert_eq!(config.publisher.buffer_capacity, 50);
        assert_eq!(config.publisher.back_pressure, BackPressurePolicy::Reject);
        assert_eq!(config.receiver.delivery_queue_capacity, 256);
    }

    #[test]
    fn test_missing_host_fails_fast() {
        let result = ServiceConfig::from_properties(&BrokerProperties::new());
        assert!(matches!(result, Err(ConfigError::MissingProperty(key)) if key == keys::TRANSPORT_HOST));
    }

    #[test]
    fn test_endpoint_parsing() {
        let bare = BrokerEndpoint::parse("broker.local").unwrap();
        assert_eq!(bare.uri(), "tcp://broker.local:1883");

        let with_port = BrokerEndpoint::parse("broker.local:55555").unwrap();
        assert_eq!(with_port.port, 55555);

        let secure = BrokerEndpoint::parse("tcps://broker.local").unwrap();
        assert!(secure.secure);
        assert_eq!(secure.port, 8883);

        let mqtts = BrokerEndpoint::parse("mqtts://broker.local:9883").unwrap();
        assert!(mqtts.secure);
        assert_eq!(mqtts.port, 9883);
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        let result = BrokerEndpoint::parse("http://broker.local");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_basic_authentication() {
        let props = minimal_properties()
            .with(keys::AUTHENTICATION_BASIC_USER_NAME, "alice")
            .with(keys::AUTHENTICATION_BASIC_PASSWORD, "s3cret");
        let config = ServiceConfig::from_properties(&props).unwrap();

        assert_eq!(
            config.authentication,
            Authentication::Basic {
                username: "alice".to_string(),
                password: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn test_authentication_debug_redacts_password() {
        let auth = Authentication::Basic {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        };
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_basic_scheme_requires_user_name() {
        let props = minimal_properties().with(keys::AUTHENTICATION_SCHEME, "basic");
        let result = ServiceConfig::from_properties(&props);
        assert!(matches!(result, Err(ConfigError::MissingProperty(_))));
    }

    #[test]
    fn test_unknown_authentication_scheme() {
        let props = minimal_properties().with(keys::AUTHENTICATION_SCHEME, "kerberos");
        assert!(ServiceConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_reconnection_properties_build_strategy() {
        let props = minimal_properties()
            .with(keys::RECONNECTION_ATTEMPTS, "5")
            .with(keys::RECONNECTION_INTERVAL_MS, "30000");
        let config = ServiceConfig::from_properties(&props).unwrap();

        assert_eq!(
            config.retry_strategy,
            RetryStrategy::parametrized_retry(5, Duration::from_secs(30))
        );
    }

    #[test]
    fn test_explicit_strategy_overrides_properties() {
        let props = minimal_properties().with(keys::RECONNECTION_ATTEMPTS, "5");
        let config = ServiceConfig::from_properties(&props)
            .unwrap()
            .with_retry_strategy(RetryStrategy::forever_retry(Duration::from_millis(10)));

        assert_eq!(
            config.retry_strategy,
            RetryStrategy::forever_retry(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_non_numeric_value_is_rejected() {
        let props = minimal_properties().with(keys::TRANSPORT_CONNECT_TIMEOUT_MS, "soon");
        let result = ServiceConfig::from_properties(&props);
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == keys::TRANSPORT_CONNECT_TIMEOUT_MS));
    }

    #[test]
    fn test_back_pressure_strategy_from_properties() {
        let props = minimal_properties()
            .with(keys::PUBLISHER_BUFFER_CAPACITY, "5")
            .with(keys::PUBLISHER_BACK_PRESSURE_STRATEGY, "block")
            .with(keys::PUBLISHER_BACK_PRESSURE_WAIT_MS, "250");
        let config = ServiceConfig::from_properties(&props).unwrap();

        assert_eq!(config.publisher.buffer_capacity, 5);
        assert_eq!(
            config.publisher.back_pressure,
            BackPressurePolicy::Block(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_zero_buffer_capacity_is_rejected() {
        let props = minimal_properties().with(keys::PUBLISHER_BUFFER_CAPACITY, "0");
        assert!(matches!(
            ServiceConfig::from_properties(&props),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_oversized_capacities_are_rejected() {
        for key in [
            keys::PUBLISHER_BUFFER_CAPACITY,
            keys::RECEIVER_DELIVERY_QUEUE_CAPACITY,
        ] {
            for value in ["18446744073709551615", "1000000000000", "1048577"] {
                let props = minimal_properties().with(key, value);
                match ServiceConfig::from_properties(&props) {
                    Err(ConfigError::InvalidValue { key: reported, .. }) => {
                        assert_eq!(reported, key)
                    }
                    other => panic!("{key}={value} accepted: {other:?}"),
                }
            }
        }

        let props = minimal_properties()
            .with(keys::PUBLISHER_BUFFER_CAPACITY, MAX_QUEUE_CAPACITY.to_string())
            .with(keys::RECEIVER_DELIVERY_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY.to_string());
        let config = ServiceConfig::from_properties(&props).unwrap();
        assert_eq!(config.publisher.buffer_capacity, MAX_QUEUE_CAPACITY);
        assert_eq!(config.receiver.delivery_queue_capacity, MAX_QUEUE_CAPACITY);
    }

    #[test]
    fn test_code_built_capacities_are_bounded() {
        assert!(PublisherConfig::on_back_pressure_reject(usize::MAX)
            .validate()
            .is_err());
        assert!(PublisherConfig::on_back_pressure_reject(0).validate().is_err());
        assert!(ReceiverConfig::with_delivery_queue_capacity(usize::MAX)
            .validate()
            .is_err());
        assert!(ReceiverConfig::with_delivery_queue_capacity(MAX_QUEUE_CAPACITY)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_transport_security_properties() {
        let props = minimal_properties()
            .with(keys::TRANSPORT_HOST, "tcps://broker.local")
            .with(keys::TLS_EXCLUDED_PROTOCOLS, "SSLv3, TLSv1")
            .with(keys::TLS_CIPHER_SUITES, "ECDHE-RSA-AES256-GCM-SHA384")
            .with(keys::TLS_DOWNGRADABLE, "true");
        let config = ServiceConfig::from_properties(&props).unwrap();

        let security = &config.transport_security;
        assert!(security.certificate_validation);
        assert!(security.downgradable);
        assert_eq!(
            security.excluded_protocols,
            vec![SecureProtocol::SslV3, SecureProtocol::TlsV1]
        );
        assert_eq!(security.cipher_suites, vec!["ECDHE-RSA-AES256-GCM-SHA384"]);
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let props = minimal_properties().with(keys::TLS_EXCLUDED_PROTOCOLS, "TLSv9");
        assert!(ServiceConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_missing_trust_store_fails_for_secure_endpoint() {
        let props = minimal_properties()
            .with(keys::TRANSPORT_HOST, "tcps://broker.local")
            .with(keys::TLS_TRUST_STORE_PATH, "/definitely/not/here");
        assert!(matches!(
            ServiceConfig::from_properties(&props),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_excluding_every_protocol_is_rejected() {
        let security = TransportSecurity::new().with_excluded_protocols(&SecureProtocol::ALL);
        assert!(security.validate().is_err());
    }

    #[test]
    fn test_excluding_both_supported_protocols_is_rejected() {
        let security = TransportSecurity::new()
            .with_excluded_protocols(&[SecureProtocol::TlsV1_2, SecureProtocol::TlsV1_3]);
        assert!(matches!(security.validate(), Err(ConfigError::InvalidConfig(_))));

        let legacy_only = TransportSecurity::new().with_excluded_protocols(&[
            SecureProtocol::SslV3,
            SecureProtocol::TlsV1,
            SecureProtocol::TlsV1_1,
            SecureProtocol::TlsV1_3,
        ]);
        assert!(legacy_only.validate().is_ok());
    }

    #[test]
    fn test_toml_tables_flatten_to_dotted_keys() {
        let content = r#"
[transport]
host = "tcp://broker.local:1883"

[service]
vpn-name = "sales"

[authentication]
scheme = "basic"
basic = { user-name = "bob", password = "pw" }

[reconnection]
attempts = 20
interval = 3000

[transport-security]
excluded-protocols = ["SSLv3", "TLSv1"]
"#;
        let props = BrokerProperties::from_toml_str(content).unwrap();

        assert_eq!(props.get_str("transport.host"), Some("tcp://broker.local:1883"));
        assert_eq!(props.get_str("service.vpn-name"), Some("sales"));
        assert_eq!(props.get_str("authentication.basic.user-name"), Some("bob"));
        assert_eq!(props.get_u64("reconnection.attempts").unwrap(), Some(20));
        assert_eq!(
            props.get_list("transport-security.excluded-protocols"),
            vec!["SSLv3", "TLSv1"]
        );

        let config = ServiceConfig::from_properties(&props).unwrap();
        assert_eq!(config.vpn_name, "sales");
        assert_eq!(
            config.retry_strategy,
            RetryStrategy::parametrized_retry(20, Duration::from_secs(3))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nhost = \"localhost\"").unwrap();

        let props = BrokerProperties::load_from_file(file.path()).unwrap();
        assert_eq!(props.get_str(keys::TRANSPORT_HOST), Some("localhost"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = BrokerProperties::load_from_file(Path::new("/no/such/props.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_bool_parsing() {
        let props = BrokerProperties::from_pairs([("a", "yes"), ("b", "OFF"), ("c", "maybe")]);
        assert_eq!(props.get_bool("a").unwrap(), Some(true));
        assert_eq!(props.get_bool("b").unwrap(), Some(false));
        assert!(props.get_bool("c").is_err());
        assert_eq!(props.get_bool("missing").unwrap(), None);
    }

    #[test]
    fn test_blank_values_are_absent() {
        let props = BrokerProperties::from_pairs([(keys::TRANSPORT_HOST, "   ")]);
        assert_eq!(props.get_str(keys::TRANSPORT_HOST), None);
        assert!(ServiceConfig::from_properties(&props).is_err());
    }
}
