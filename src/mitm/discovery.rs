//! Hostname discovery for new frontend connections
//!
//! The target hostname must be known before the frontend handshake can pick
//! a certificate. Two paths exist:
//! 1. An explicit tunnel request (`CONNECT host:port`) peeked off the raw socket
//! 2. The SNI hostname from the ClientHello, read before any certificate is chosen
//!
//! A connection offering neither is dropped before any handshake byte is sent.

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_rustls::{LazyConfigAcceptor, StartHandshake};
use tracing::{debug, info, warn};

use super::certificate_store::{CertificateStore, ForgedCertificate};
use super::error::{InterceptError, Result};
use super::http_parser::{parse_authority, parse_http1_request, HttpRequest, DEFAULT_TLS_PORT};
use super::tls_config::FrontendTls;
use super::tls_session::{Handshake, IoPolicy, TlsSession};

/// How many bytes are peeked looking for a tunnel request
pub const PEEK_LIMIT: usize = 1024;

/// TLS record content type of a handshake message
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

const PEEK_RETRY: Duration = Duration::from_millis(10);

/// What the first bytes of a connection look like
#[derive(Debug)]
pub enum Preamble {
    /// A well-formed CONNECT request, still unread on the socket
    Tunnel {
        request: HttpRequest,
        host: String,
        port: u16,
    },
    /// Anything else; left to the TLS acceptor
    NoTunnel,
}

/// Peek at the socket and classify the connection without consuming anything
///
/// Waits up to `wait` while the peeked bytes are an incomplete HTTP head.
/// A CONNECT whose target cannot be parsed is a protocol error.
pub async fn detect_tunnel_request(stream: &TcpStream, wait: Duration) -> Result<Preamble> {
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; PEEK_LIMIT];

    loop {
        let n = timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| InterceptError::protocol("no client data before discovery deadline"))??;

        if n == 0 {
            return Err(InterceptError::protocol("client closed before sending data"));
        }
        if buf[0] == TLS_HANDSHAKE_RECORD {
            return Ok(Preamble::NoTunnel);
        }

        match parse_http1_request(&buf[..n]) {
            Ok(request) if request.is_connect() => {
                let (host, port) = parse_authority(&request.target, DEFAULT_TLS_PORT)
                    .map_err(|e| InterceptError::protocol(format!("malformed tunnel request: {}", e)))?;
                return Ok(Preamble::Tunnel {
                    request,
                    host,
                    port,
                });
            }
            Ok(_) => return Ok(Preamble::NoTunnel),
            Err(e) if e.is_incomplete() && n < PEEK_LIMIT => {
                if Instant::now() >= deadline {
                    return Err(InterceptError::protocol("incomplete tunnel request"));
                }
                sleep(PEEK_RETRY).await;
            }
            Err(_) => return Ok(Preamble::NoTunnel),
        }
    }
}

/// Acknowledgement sent once the tunnel target's certificate is ready
///
/// Echoes the client's Host header, or the tunnel target when it has none.
pub fn connection_established(request: &HttpRequest) -> String {
    let host = request
        .headers
        .get("host")
        .unwrap_or(request.target.as_str());
    format!("HTTP/1.1 200 Connection Established\r\nhost: {}\r\n\r\n", host)
}

/// Supplies the certificate for a discovered hostname
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    async fn resolve(&self, hostname: &str, port: u16) -> Result<ForgedCertificate>;
}

#[async_trait]
impl HostnameResolver for CertificateStore {
    async fn resolve(&self, hostname: &str, port: u16) -> Result<ForgedCertificate> {
        self.certificate_for(hostname, port).await
    }
}

/// Which path discovered the hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPath {
    Tunnel,
    ServerNameIndication,
}

/// Per-connection state threaded through discovery and the handshake
#[derive(Debug)]
pub struct HandshakeContext {
    pub session_id: u64,
    pub peer: Option<SocketAddr>,
    pub path: Option<DiscoveryPath>,
    /// Host and port the certificate was selected for
    pub target: Option<(String, u16)>,
    pub certificate: Option<CertificateDer<'static>>,
    /// Backend session left over from a certificate fetch
    pub origin: Option<TlsSession>,
    /// Certificate lookups performed for this connection
    pub fetches: u32,
    opened: Instant,
}

impl HandshakeContext {
    pub fn new(session_id: u64, peer: Option<SocketAddr>) -> Self {
        Self {
            session_id,
            peer,
            path: None,
            target: None,
            certificate: None,
            origin: None,
            fetches: 0,
            opened: Instant::now(),
        }
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some()
    }

    fn install(&mut self, path: DiscoveryPath, host: String, port: u16, forged: ForgedCertificate) {
        self.path = Some(path);
        self.target = Some((host, port));
        self.certificate = Some(forged.cert);
        self.origin = forged.origin;
    }
}

/// ClientHello read and certificate installed; the handshake is still pending
pub struct PendingHandshake {
    start: StartHandshake<TcpStream>,
    config: Arc<ServerConfig>,
    host: String,
    port: u16,
}

impl fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Frontend session ready for the pipeline
#[derive(Debug)]
pub struct AcceptedFrontend {
    pub session: TlsSession,
    pub host: String,
    pub port: u16,
}

/// Runs hostname discovery and the frontend handshake
///
/// Discovery is split in steps so callers can observe the moment a certificate
/// is installed: [`take_tunnel`](Self::take_tunnel), then
/// [`client_hello`](Self::client_hello), then [`complete`](Self::complete).
/// All three share one deadline of `handshake_timeout` from connection open.
pub struct FrontendAcceptor {
    resolver: Arc<dyn HostnameResolver>,
    tls: Arc<FrontendTls>,
    policy: IoPolicy,
    sni_default_port: u16,
}

impl FrontendAcceptor {
    pub fn new(
        resolver: Arc<dyn HostnameResolver>,
        tls: Arc<FrontendTls>,
        policy: IoPolicy,
        sni_default_port: u16,
    ) -> Self {
        Self {
            resolver,
            tls,
            policy,
            sni_default_port,
        }
    }

    fn deadline(&self, ctx: &HandshakeContext) -> Instant {
        ctx.opened + self.policy.handshake_timeout
    }

    /// Consume a tunnel request if one leads the stream, install its certificate and reply
    ///
    /// Leaves the stream untouched when it does not start with a tunnel request.
    pub async fn take_tunnel(&self, stream: &mut TcpStream, ctx: &mut HandshakeContext) -> Result<()> {
        let wait = self.deadline(ctx).saturating_duration_since(Instant::now());

        if let Preamble::Tunnel {
            request,
            host,
            port,
        } = detect_tunnel_request(stream, wait).await?
        {
            let mut consumed = vec![0u8; request.header_len];
            stream.read_exact(&mut consumed).await?;

            let forged = self.fetch(ctx, &host, port).await?;
            ctx.install(DiscoveryPath::Tunnel, host.clone(), port, forged);

            stream
                .write_all(connection_established(&request).as_bytes())
                .await?;
            stream.flush().await?;
            debug!(session_id = ctx.session_id, host = %host, port, "Tunnel established");
        }
        Ok(())
    }

    /// Read the ClientHello, falling back to its SNI hostname when no tunnel supplied one
    ///
    /// Returns `Ok(None)` when the client offered no hostname; the socket is
    /// dropped without sending any handshake bytes.
    pub async fn client_hello(
        &self,
        stream: TcpStream,
        ctx: &mut HandshakeContext,
    ) -> Result<Option<PendingHandshake>> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = timeout_at(self.deadline(ctx), acceptor)
            .await
            .map_err(|_| InterceptError::tls("timed out waiting for ClientHello"))?
            .map_err(|e| InterceptError::tls(format!("invalid ClientHello: {}", e)))?;

        if !ctx.has_certificate() {
            let server_name = start.client_hello().server_name().map(str::to_owned);
            match server_name {
                Some(host) => {
                    let port = self.sni_default_port;
                    let forged = self.fetch(ctx, &host, port).await?;
                    ctx.install(DiscoveryPath::ServerNameIndication, host, port, forged);
                }
                None => {
                    warn!(
                        session_id = ctx.session_id,
                        peer = ?ctx.peer,
                        "No tunnel request or SNI hostname, dropping connection"
                    );
                    return Ok(None);
                }
            }
        }

        let (host, port) = ctx
            .target
            .clone()
            .ok_or_else(|| InterceptError::protocol("hostname missing after discovery"))?;
        let leaf = ctx
            .certificate
            .as_ref()
            .ok_or_else(|| InterceptError::protocol("certificate missing after discovery"))?;
        let config = self.tls.server_config_for(leaf)?;

        Ok(Some(PendingHandshake {
            start,
            config,
            host,
            port,
        }))
    }

    /// Finish the frontend handshake with the installed certificate
    pub async fn complete(
        &self,
        pending: PendingHandshake,
        ctx: &HandshakeContext,
    ) -> Result<AcceptedFrontend> {
        let PendingHandshake {
            start,
            config,
            host,
            port,
        } = pending;

        let remaining = self.deadline(ctx).saturating_duration_since(Instant::now());
        let policy = IoPolicy {
            handshake_timeout: remaining,
            ..self.policy
        };
        let mut session =
            TlsSession::handshake(Handshake::Accept { start, config }, policy).await?;
        session.set_policy(self.policy);

        info!(
            session_id = ctx.session_id,
            host = %host,
            port,
            path = ?ctx.path,
            "Frontend handshake complete"
        );

        Ok(AcceptedFrontend {
            session,
            host,
            port,
        })
    }

    async fn fetch(
        &self,
        ctx: &mut HandshakeContext,
        host: &str,
        port: u16,
    ) -> Result<ForgedCertificate> {
        ctx.fetches += 1;
        let lookup = self.resolver.resolve(host, port);
        let wait = self.deadline(ctx).saturating_duration_since(Instant::now());
        timeout(wait, lookup).await.map_err(|_| {
            InterceptError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("certificate for {}:{} timed out", host, port),
            ))
        })?
    }
}
