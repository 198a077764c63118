//! Origin connector - opens the backend TLS session to the real server

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::error::{InterceptError, Result};
use super::tls_config::{SniUtils, TlsConfigBuilder};
use super::tls_session::{Handshake, IoPolicy, TlsSession};

/// Settings for origin-facing connections
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Local address origin sockets bind to (`None` or unspecified: no bind)
    pub local_address: Option<IpAddr>,
    /// Bound for resolve, connect, handshake and each write
    pub timeout: Duration,
    /// Read loop timing of backend sessions
    pub io: IoPolicy,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            local_address: None,
            timeout: Duration::from_secs(2),
            io: IoPolicy::default(),
        }
    }
}

/// Opens client-role [`TlsSession`]s to origins
///
/// Certificate verification is disabled on this leg; the origin's
/// certificate is only copied, never trusted.
#[derive(Clone)]
pub struct OriginConnector {
    connector: TlsConnector,
    local_address: Option<IpAddr>,
    timeout: Duration,
    policy: IoPolicy,
}

impl OriginConnector {
    pub fn new(settings: &UpstreamSettings) -> Result<Self> {
        let upstream = TlsConfigBuilder::new().build_upstream()?;

        let policy = IoPolicy {
            write_timeout: settings.timeout,
            handshake_timeout: settings.timeout,
            ..settings.io
        };

        Ok(Self {
            connector: TlsConnector::from(upstream.client_config()),
            local_address: settings.local_address.filter(|ip| !ip.is_unspecified()),
            timeout: settings.timeout,
            policy,
        })
    }

    /// Resolve `host`, connect from the configured local address, and handshake
    pub async fn connect(&self, host: &str, port: u16) -> Result<TlsSession> {
        let server_name = SniUtils::parse_server_name(host)?;

        let addr = self.resolve(host, port).await?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(local) = self.local_address {
            if local.is_ipv4() == addr.is_ipv4() {
                socket.bind(SocketAddr::new(local, 0))?;
            }
        }

        let stream = timeout(self.timeout, socket.connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )
            })??;
        stream.set_nodelay(true)?;

        debug!(host = %host, port, addr = %addr, "Origin TCP connection established");

        let session = TlsSession::handshake(
            Handshake::Connect {
                connector: self.connector.clone(),
                server_name,
                stream,
            },
            self.policy,
        )
        .await?;

        info!(host = %host, port, "Backend TLS session established");
        Ok(session)
    }

    /// Pick a resolved address, preferring the local address's family
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let resolved: Vec<SocketAddr> = timeout(self.timeout, lookup_host((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("resolving {} timed out", host),
                )
            })??
            .collect();

        let preferred = self.local_address.and_then(|local| {
            resolved
                .iter()
                .find(|addr| addr.is_ipv4() == local.is_ipv4())
                .copied()
        });

        preferred
            .or_else(|| resolved.first().copied())
            .ok_or_else(|| {
                InterceptError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", host),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::error::ErrorKind;
    use crate::mitm::tls_config::ClientTlsConfig;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    async fn spawn_origin() -> (u16, CertificateDer<'static>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let der = cert.der().clone();
        let config = ClientTlsConfig::new(
            vec![der.clone()],
            PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        )
        .unwrap();
        let acceptor = TlsAcceptor::from(config.server_config());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(tcp).await {
                        let mut buf = [0u8; 64];
                        let _ = tokio::io::AsyncReadExt::read(&mut tls, &mut buf).await;
                    }
                });
            }
        });

        (port, der)
    }

    fn settings() -> UpstreamSettings {
        UpstreamSettings {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..UpstreamSettings::default()
        }
    }

    #[tokio::test]
    async fn test_connect_exposes_origin_certificate() {
        let (port, der) = spawn_origin().await;
        let connector = OriginConnector::new(&settings()).unwrap();

        let session = connector.connect("localhost", port).await.unwrap();
        assert_eq!(session.peer_certificate(), Some(der));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_unspecified_local_address_is_not_bound() {
        let connector = OriginConnector::new(&UpstreamSettings {
            local_address: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            ..UpstreamSettings::default()
        })
        .unwrap();
        assert!(connector.local_address.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = OriginConnector::new(&settings()).unwrap();
        let err = connector.connect("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_invalid_hostname_is_rejected() {
        let connector = OriginConnector::new(&settings()).unwrap();
        let err = connector.connect("", 443).await.unwrap_err();
        assert!(matches!(err, InterceptError::TlsConfig(_)));
    }
}
