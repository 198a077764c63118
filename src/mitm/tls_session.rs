//! TLS session wrapper shared by the frontend and backend legs
//!
//! A [`TlsSession`] owns exactly one TCP socket promoted to TLS, in either
//! role. Reads use a bounded poll loop that gathers everything the peer has
//! sent; closing is idempotent and releases the socket.

use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ServerConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::{StartHandshake, TlsConnector, TlsStream};
use tracing::{debug, trace, warn};

use super::error::{InterceptError, Result};

const READ_CHUNK: usize = 16 * 1024;

/// Which side of the handshake this session played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Accept side (proxy ← client)
    Server,
    /// Connect side (proxy → origin)
    Client,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Server => f.write_str("frontend"),
            SessionRole::Client => f.write_str("backend"),
        }
    }
}

/// Timing rules for handshakes and the read/write loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPolicy {
    /// Bounded wait of one read poll
    pub poll_interval: Duration,
    /// How long reads keep polling while nothing has arrived
    pub first_byte_timeout: Duration,
    /// Upper bound for writing and flushing one buffer
    pub write_timeout: Duration,
    /// Upper bound for the handshake
    pub handshake_timeout: Duration,
    /// Largest burst one `read` gathers; the rest stays on the socket
    pub max_read_bytes: usize,
}

pub const DEFAULT_MAX_READ_BYTES: usize = 1_024_000;

impl Default for IoPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            first_byte_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

/// Input of [`TlsSession::handshake`], one variant per role
pub enum Handshake {
    /// Finish a server handshake whose ClientHello was already read
    Accept {
        start: StartHandshake<TcpStream>,
        config: Arc<ServerConfig>,
    },
    /// Run a client handshake over a connected socket
    Connect {
        connector: TlsConnector,
        server_name: ServerName<'static>,
        stream: TcpStream,
    },
}

impl Handshake {
    fn role(&self) -> SessionRole {
        match self {
            Handshake::Accept { .. } => SessionRole::Server,
            Handshake::Connect { .. } => SessionRole::Client,
        }
    }
}

/// One TLS connection in either role
pub struct TlsSession {
    stream: Option<TlsStream<TcpStream>>,
    role: SessionRole,
    policy: IoPolicy,
    peer: Option<SocketAddr>,
}

impl TlsSession {
    /// Perform the handshake for the given role
    ///
    /// A failed handshake is reported and never retried; the socket is dropped.
    pub async fn handshake(handshake: Handshake, policy: IoPolicy) -> Result<Self> {
        let role = handshake.role();

        let result = match handshake {
            Handshake::Accept { start, config } => {
                timeout(policy.handshake_timeout, start.into_stream(config))
                    .await
                    .map(|r| r.map(TlsStream::from))
            }
            Handshake::Connect {
                connector,
                server_name,
                stream,
            } => timeout(
                policy.handshake_timeout,
                connector.connect(server_name, stream),
            )
            .await
            .map(|r| r.map(TlsStream::from)),
        };

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(InterceptError::tls(format!("{} handshake failed: {}", role, e)))
            }
            Err(_) => {
                return Err(InterceptError::tls(format!(
                    "{} handshake timed out after {:?}",
                    role, policy.handshake_timeout
                )))
            }
        };

        let peer = stream.get_ref().0.peer_addr().ok();
        debug!(role = %role, peer = ?peer, "TLS handshake complete");

        Ok(Self {
            stream: Some(stream),
            role,
            policy,
            peer,
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn policy(&self) -> IoPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: IoPolicy) {
        self.policy = policy;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Leaf certificate presented by the peer
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let certs = match self.stream.as_ref()? {
            TlsStream::Client(stream) => stream.get_ref().1.peer_certificates(),
            TlsStream::Server(stream) => stream.get_ref().1.peer_certificates(),
        };
        certs
            .and_then(|chain| chain.first())
            .map(|cert| cert.clone().into_owned())
    }

    /// Negotiated ALPN protocol, if any
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        let protocol = match self.stream.as_ref()? {
            TlsStream::Client(stream) => stream.get_ref().1.alpn_protocol(),
            TlsStream::Server(stream) => stream.get_ref().1.alpn_protocol(),
        };
        protocol.map(<[u8]>::to_vec)
    }

    /// Read everything the peer sends in one burst
    ///
    /// Polls in `poll_interval` slices. While nothing has arrived the loop
    /// keeps waiting up to `first_byte_timeout`; once data is buffered the
    /// first quiet poll ends the read, as does reaching `max_read_bytes`.
    /// A clean shutdown from the peer or a
    /// fatal TLS error ends the loop and closes the session; bytes gathered
    /// before a fatal error are still returned.
    pub async fn read(&mut self) -> Result<Bytes> {
        let policy = self.policy;
        let stream = self.stream.as_mut().ok_or(InterceptError::SessionClosed)?;

        let limit = policy.max_read_bytes.max(1);
        let mut buf = BytesMut::with_capacity(READ_CHUNK.min(limit));
        let mut chunk = vec![0u8; READ_CHUNK.min(limit)];
        let started = Instant::now();
        let mut peer_closed = false;
        let mut failure = None;

        while buf.len() < limit {
            let want = chunk.len().min(limit - buf.len());
            match timeout(policy.poll_interval, stream.read(&mut chunk[..want])).await {
                Ok(Ok(0)) => {
                    peer_closed = true;
                    break;
                }
                Ok(Ok(n)) => {
                    trace!(role = %self.role, bytes = n, "read chunk");
                    buf.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(_) => {
                    if !buf.is_empty() || started.elapsed() >= policy.first_byte_timeout {
                        break;
                    }
                }
            }
        }

        if buf.len() >= limit {
            debug!(role = %self.role, limit, "read stopped at size limit");
        }

        if peer_closed {
            debug!(role = %self.role, peer = ?self.peer, "peer closed TLS session");
            self.close(true).await;
        } else if let Some(e) = failure {
            self.close(false).await;
            if buf.is_empty() {
                return Err(InterceptError::tls(format!("{} read failed: {}", self.role, e)));
            }
            debug!(role = %self.role, error = %e, "read ended by error after data");
        }

        debug!(role = %self.role, bytes = buf.len(), "read complete");
        Ok(buf.freeze())
    }

    /// Write and flush the whole buffer
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let write_timeout = self.policy.write_timeout;
        let stream = self.stream.as_mut().ok_or(InterceptError::SessionClosed)?;

        let result = timeout(write_timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(role = %self.role, bytes = data.len(), "write complete");
                Ok(data.len())
            }
            Ok(Err(e)) => {
                self.close(false).await;
                Err(InterceptError::tls(format!("{} write failed: {}", self.role, e)))
            }
            Err(_) => {
                self.close(false).await;
                Err(InterceptError::tls(format!(
                    "{} write timed out after {:?}",
                    self.role, write_timeout
                )))
            }
        }
    }

    /// Close the session, sending close_notify first when `graceful`
    ///
    /// Returns `false` when the session was already closed.
    pub async fn close(&mut self, graceful: bool) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };

        if graceful {
            match timeout(self.policy.poll_interval, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(role = %self.role, error = %e, "TLS shutdown failed"),
                Err(_) => debug!(role = %self.role, "TLS shutdown timed out"),
            }
        }

        debug!(role = %self.role, peer = ?self.peer, graceful, "TLS session closed");
        true
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        let role = self.role;
        let wait = self.policy.poll_interval;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = timeout(wait, stream.shutdown()).await;
                    trace!(role = %role, "TLS session closed on drop");
                });
            }
            Err(_) => warn!(role = %role, "TLS session dropped outside runtime, closing abruptly"),
        }
    }
}
