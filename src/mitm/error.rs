//! Interception error types

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::tls_config::TlsConfigError;

/// Result type for interception operations
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Coarse classification of an [`InterceptError`], used as a log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Tls,
    Certificate,
    Protocol,
    Pipeline,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Tls => "tls",
            ErrorKind::Certificate => "certificate",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while loading, forging, or verifying certificates
#[derive(Error, Debug)]
pub enum CertificateError {
    /// Key or certificate file could not be read
    #[error("Failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// PEM or DER content could not be parsed
    #[error("Failed to parse certificate material: {0}")]
    Parse(String),

    /// The origin presented no certificate
    #[error("Origin {0} presented no certificate")]
    NoPeerCertificate(String),

    /// Signing the cloned certificate failed
    #[error("Failed to sign certificate: {0}")]
    Sign(String),

    /// The minted certificate does not chain to the local CA
    #[error("Certificate verification failed: {0}")]
    Verify(String),

    /// Hostname cannot be used as a cache key
    #[error("Invalid hostname for certificate cache: {0}")]
    InvalidHostname(String),

    /// Writing the cache entry failed
    #[error("Failed to persist certificate to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Interception errors
#[derive(Error, Debug)]
pub enum InterceptError {
    /// Socket or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake, read, or write failure in the TLS layer
    #[error("TLS error: {0}")]
    Tls(String),

    /// Building a rustls configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfig(#[from] TlsConfigError),

    /// Certificate load/clone/sign/verify failure
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Malformed hostname-discovery input
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A pipeline stage reported an error
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Operation attempted on a closed TLS session
    #[error("TLS session already closed")]
    SessionClosed,
}

impl InterceptError {
    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a pipeline error
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Tls(_) | Self::TlsConfig(_) | Self::SessionClosed => ErrorKind::Tls,
            Self::Certificate(_) => ErrorKind::Certificate,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Pipeline(_) => ErrorKind::Pipeline,
        }
    }
}
