//! TLS Configuration - rustls settings for both interception legs
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) presenting a forged certificate
//! - Upstream TLS (proxy → origin) with certificate verification disabled
//!
//! The upstream leg accepts any origin certificate; its identity is copied
//! into the forged certificate, never trusted. Handshake signatures are
//! still checked against the presented certificate.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{
    ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme, SupportedCipherSuite,
    SupportedProtocolVersion,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// ALPN identifier for the only protocol the proxy relays
pub const HTTP11_ALPN: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown cipher suite: {0}")]
    UnknownCipherSuite(String),

    #[error("No supported cipher suites")]
    NoCipherSuites,

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

impl From<rustls::Error> for TlsConfigError {
    fn from(err: rustls::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersion {
    fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls12And13 => vec![&TLS12, &TLS13],
            TlsVersion::Tls13Only => vec![&TLS13],
        }
    }
}

/// Resolve a cipher list into rustls suites.
///
/// Accepts `ALL` (or `DEFAULT`) for every suite the ring provider ships, or a
/// colon/comma separated list of rustls suite names such as
/// `TLS13_AES_128_GCM_SHA256:TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256`.
/// Names are matched case-insensitively.
pub fn select_cipher_suites(list: &str) -> Result<Vec<SupportedCipherSuite>, TlsConfigError> {
    let all = rustls::crypto::ring::ALL_CIPHER_SUITES;
    let names: Vec<&str> = list
        .split([':', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();

    if names.is_empty() {
        return Err(TlsConfigError::NoCipherSuites);
    }

    if names
        .iter()
        .any(|name| name.eq_ignore_ascii_case("ALL") || name.eq_ignore_ascii_case("DEFAULT"))
    {
        return Ok(all.to_vec());
    }

    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let suite = all
            .iter()
            .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
            .ok_or_else(|| TlsConfigError::UnknownCipherSuite(name.to_string()))?;
        if !selected.contains(suite) {
            selected.push(*suite);
        }
    }

    Ok(selected)
}

/// Client-facing TLS config (proxy acts as server with a forged cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build server config with the default provider and versions
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        TlsConfigBuilder::new().build_client_facing(cert_chain, private_key)
    }

    fn with_provider(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        tls_version: TlsVersion,
        provider: Arc<CryptoProvider>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&tls_version.protocol_versions())?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)?;

        config.alpn_protocols = alpn_protocols;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client, verification disabled)
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Build client config with the default provider and versions
    pub fn new() -> Result<Self, TlsConfigError> {
        TlsConfigBuilder::new().build_upstream()
    }

    fn with_provider(
        tls_version: TlsVersion,
        provider: Arc<CryptoProvider>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let verifier = Arc::new(AcceptAnyServerCert::new(
            provider.signature_verification_algorithms,
        ));

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&tls_version.protocol_versions())?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        config.alpn_protocols = alpn_protocols;

        debug!(tls_version = ?tls_version, "Upstream TLS config created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// TLS config builder shared by both legs
#[derive(Debug, Clone)]
pub struct TlsConfigBuilder {
    tls_version: TlsVersion,
    alpn_protocols: Vec<Vec<u8>>,
    cipher_suites: Vec<SupportedCipherSuite>,
}

impl TlsConfigBuilder {
    /// Create new builder: TLS 1.2+1.3, `http/1.1` ALPN, every ring cipher suite
    pub fn new() -> Self {
        Self {
            tls_version: TlsVersion::Tls12And13,
            alpn_protocols: vec![HTTP11_ALPN.to_vec()],
            cipher_suites: rustls::crypto::ring::ALL_CIPHER_SUITES.to_vec(),
        }
    }

    /// Set TLS version preference
    pub fn tls_version(mut self, version: TlsVersion) -> Self {
        self.tls_version = version;
        self
    }

    /// Set ALPN protocols
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Restrict cipher suites to a configured list (see [`select_cipher_suites`])
    pub fn cipher_list(mut self, list: &str) -> Result<Self, TlsConfigError> {
        self.cipher_suites = select_cipher_suites(list)?;
        Ok(self)
    }

    /// Number of cipher suites this builder will offer
    pub fn cipher_suite_count(&self) -> usize {
        self.cipher_suites.len()
    }

    fn provider(&self) -> Arc<CryptoProvider> {
        let mut provider = rustls::crypto::ring::default_provider();
        provider.cipher_suites = self.cipher_suites.clone();
        Arc::new(provider)
    }

    /// Build upstream TLS config (all cipher suites, the list only binds the client-facing leg)
    pub fn build_upstream(&self) -> Result<UpstreamTlsConfig, TlsConfigError> {
        UpstreamTlsConfig::with_provider(
            self.tls_version,
            Arc::new(rustls::crypto::ring::default_provider()),
            self.alpn_protocols.clone(),
        )
    }

    /// Build client-facing TLS config
    pub fn build_client_facing(
        &self,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<ClientTlsConfig, TlsConfigError> {
        ClientTlsConfig::with_provider(
            cert_chain,
            private_key,
            self.tls_version,
            self.provider(),
            self.alpn_protocols.clone(),
        )
    }
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the frontend `ServerConfig` for each forged certificate
///
/// The served chain is `[forged leaf, CA]`, keyed by the shared serving key.
pub struct FrontendTls {
    builder: TlsConfigBuilder,
    serving_key: PrivateKeyDer<'static>,
    ca_cert: CertificateDer<'static>,
}

impl FrontendTls {
    pub fn new(
        builder: TlsConfigBuilder,
        serving_key: PrivateKeyDer<'static>,
        ca_cert: CertificateDer<'static>,
    ) -> Self {
        Self {
            builder,
            serving_key,
            ca_cert,
        }
    }

    /// Server config presenting `leaf`
    pub fn server_config_for(
        &self,
        leaf: &CertificateDer<'static>,
    ) -> Result<Arc<ServerConfig>, TlsConfigError> {
        let chain = vec![leaf.clone(), self.ca_cert.clone()];
        let config = self
            .builder
            .build_client_facing(chain, self.serving_key.clone_key())?;
        Ok(config.server_config())
    }
}

/// Server certificate verifier that accepts any origin identity.
///
/// Only the handshake signatures are verified.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    pub fn new(algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self { algorithms }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253
    }
}
