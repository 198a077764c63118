//! TLS interception core
//!
//! This module provides everything one intercepted connection needs:
//! - Certificate store that forges origin certificates under the local CA
//! - Frontend and backend TLS sessions with a bounded read loop
//! - Hostname discovery through a tunnel request or SNI
//! - Middleware pipeline relaying the decrypted exchange to the origin

pub mod certificate_store;
pub mod discovery;
pub mod error;
pub mod http_parser;
pub mod intercept;
pub mod logging;
pub mod origin;
pub mod pipeline;
pub mod stages;
pub mod tls_config;
pub mod tls_session;

// Re-export main types
pub use certificate_store::{
    verify_issued_by, CertificateStore, ForgedCertificate, StoreConfig, StoreStats,
};
pub use discovery::{
    connection_established, detect_tunnel_request, AcceptedFrontend, DiscoveryPath,
    FrontendAcceptor, HandshakeContext, HostnameResolver, PendingHandshake, Preamble,
};
pub use error::{CertificateError, ErrorKind, InterceptError};
pub use http_parser::{
    parse_authority, parse_http1_request, parse_http1_response, Headers, HttpMessage,
    HttpRequest, HttpResponse, ParseError as HttpParseError,
};
pub use intercept::{InterceptSession, ProxyContext, SessionOutcome, SessionState};
pub use logging::{redact_headers, RedactedHeaders};
pub use origin::{OriginConnector, UpstreamSettings};
pub use pipeline::{Next, Pipeline, PipelineMessage, Stage};
pub use stages::{HttpRewriteStage, LogHttpStage, OriginRelayStage};
pub use tls_config::{FrontendTls, SniUtils, TlsConfigBuilder, TlsConfigError, TlsVersion};
pub use tls_session::{Handshake, IoPolicy, SessionRole, TlsSession};
