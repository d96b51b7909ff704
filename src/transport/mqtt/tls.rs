//! rustls client configuration from [`TransportSecurity`]
//!
//! rustls only speaks TLSv1.2 and TLSv1.3, so excluding older protocol
//! versions needs no action here.

use crate::config::{ConfigError, SecureProtocol, TransportSecurity};
use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, CipherSuite, ClientConfig, DigitallySignedStruct, Error as TlsError,
    RootCertStore, SignatureScheme, SupportedCipherSuite, SupportedProtocolVersion,
};
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// OpenSSL names for the suites the ring provider implements
///
/// IANA names are matched against the suite itself.
const OPENSSL_SUITE_NAMES: &[(CipherSuite, &str)] = &[
    (CipherSuite::TLS13_AES_256_GCM_SHA384, "TLS_AES_256_GCM_SHA384"),
    (CipherSuite::TLS13_AES_128_GCM_SHA256, "TLS_AES_128_GCM_SHA256"),
    (
        CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
        "TLS_CHACHA20_POLY1305_SHA256",
    ),
    (
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        "ECDHE-ECDSA-AES256-GCM-SHA384",
    ),
    (
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        "ECDHE-ECDSA-AES128-GCM-SHA256",
    ),
    (
        CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        "ECDHE-ECDSA-CHACHA20-POLY1305",
    ),
    (
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        "ECDHE-RSA-AES256-GCM-SHA384",
    ),
    (
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        "ECDHE-RSA-AES128-GCM-SHA256",
    ),
    (
        CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        "ECDHE-RSA-CHACHA20-POLY1305",
    ),
];

/// Step back in time when re-checking an expired chain
const EXPIRY_LOOKBACK_STEP: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Roughly twenty years of steps
const EXPIRY_LOOKBACK_STEPS: u32 = 240;

/// Client configuration honoring every [`TransportSecurity`] setting
pub fn client_config(security: &TransportSecurity) -> Result<ClientConfig, ConfigError> {
    let provider = Arc::new(crypto_provider(&security.cipher_suites)?);
    let versions = protocol_versions(&security.excluded_protocols)?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| ConfigError::InvalidConfig(format!("unusable TLS settings: {e}")))?;

    if !security.certificate_validation {
        warn!("Server certificate validation is disabled");
        let verifier = Arc::new(AcceptAnyServerCert {
            algorithms: provider.signature_verification_algorithms,
        });
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth());
    }

    let roots = Arc::new(root_store(security.trust_store_path.as_deref())?);
    let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider)
        .build()
        .map_err(|e| ConfigError::InvalidConfig(format!("cannot build certificate verifier: {e}")))?;

    let builder = if security.ignore_expiration {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(IgnoreExpiration { inner: webpki }))
    } else {
        builder.with_webpki_verifier(webpki)
    };
    Ok(builder.with_no_client_auth())
}

/// Ring provider restricted to the named suites, in the order given
fn crypto_provider(names: &[String]) -> Result<CryptoProvider, ConfigError> {
    let mut provider = ring::default_provider();
    if names.is_empty() {
        return Ok(provider);
    }

    let mut selected: Vec<SupportedCipherSuite> = Vec::new();
    for name in names {
        match provider
            .cipher_suites
            .iter()
            .find(|suite| suite_matches(suite.suite(), name))
        {
            Some(suite) if !selected.contains(suite) => selected.push(*suite),
            Some(_) => {}
            None => warn!(suite = %name, "Ignoring unsupported cipher suite"),
        }
    }

    if selected.is_empty() {
        return Err(ConfigError::InvalidConfig(format!(
            "none of the cipher suites {names:?} is supported"
        )));
    }
    debug!(suites = ?selected.iter().map(|s| s.suite()).collect::<Vec<_>>(), "Restricting cipher suites");
    provider.cipher_suites = selected;
    Ok(provider)
}

fn suite_matches(suite: CipherSuite, name: &str) -> bool {
    format!("{suite:?}").eq_ignore_ascii_case(name)
        || OPENSSL_SUITE_NAMES
            .iter()
            .any(|(known, alias)| *known == suite && alias.eq_ignore_ascii_case(name))
}

/// TLS versions left after exclusions, newest first
fn protocol_versions(
    excluded: &[SecureProtocol],
) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
    let versions: Vec<&'static SupportedProtocolVersion> = [
        (SecureProtocol::TlsV1_3, &rustls::version::TLS13),
        (SecureProtocol::TlsV1_2, &rustls::version::TLS12),
    ]
    .into_iter()
    .filter(|(protocol, _)| !excluded.contains(protocol))
    .map(|(_, version)| version)
    .collect();

    if versions.is_empty() {
        return Err(ConfigError::InvalidConfig(
            "TLSv1.2 and TLSv1.3 are both excluded".to_string(),
        ));
    }
    Ok(versions)
}

/// Roots from the trust store, or the platform roots when none is configured
fn root_store(trust_store: Option<&Path>) -> Result<RootCertStore, ConfigError> {
    let certs = match trust_store {
        Some(path) => {
            let bundle = load_trust_store(path)?;
            rustls_pemfile::certs(&mut BufReader::new(Cursor::new(bundle)))
                .collect::<Result<Vec<_>, _>>()?
        }
        None => rustls_native_certs::load_native_certs()?,
    };

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(ignored, "Skipped unparsable trust store certificates");
    }
    if added == 0 {
        let source = trust_store
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "the platform".to_string());
        return Err(ConfigError::InvalidConfig(format!(
            "no usable root certificates in {source}"
        )));
    }
    Ok(roots)
}

/// PEM bundle from a file, or from every `.pem`/`.crt` file in a directory
pub fn load_trust_store(path: &Path) -> Result<Vec<u8>, ConfigError> {
    if path.is_file() {
        return Ok(std::fs::read(path)?);
    }

    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("pem") || e.eq_ignore_ascii_case("crt"))
        })
        .collect();
    entries.sort();

    let mut bundle = Vec::new();
    for entry in entries {
        bundle.extend(std::fs::read(&entry)?);
        bundle.push(b'\n');
    }

    if bundle.is_empty() {
        return Err(ConfigError::InvalidConfig(format!(
            "trust store {} contains no .pem or .crt files",
            path.display()
        )));
    }
    Ok(bundle)
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Full chain and name verification, judged at a time the chain was valid
///
/// An expired chain is re-verified at earlier instants until it is in its
/// validity window, so trust anchor and host name checks still apply.
#[derive(Debug)]
struct IgnoreExpiration {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreExpiration {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let mut at = now;
        for _ in 0..=EXPIRY_LOOKBACK_STEPS {
            match self
                .inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, at)
            {
                Err(TlsError::InvalidCertificate(CertificateError::Expired)) => {
                    let Some(earlier) = at.as_secs().checked_sub(EXPIRY_LOOKBACK_STEP.as_secs())
                    else {
                        break;
                    };
                    at = UnixTime::since_unix_epoch(Duration::from_secs(earlier));
                }
                Ok(verified) => {
                    if at != now {
                        warn!(server = ?server_name, "Accepting expired server certificate");
                    }
                    return Ok(verified);
                }
                Err(e) => return Err(e),
            }
        }
        Err(TlsError::InvalidCertificate(CertificateError::Expired))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
