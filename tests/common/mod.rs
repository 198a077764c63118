//! Shared fixtures: a local CA, a loopback TLS origin and a proxy context

#![allow(dead_code)]

use interpose::mitm::{
    CertificateStore, IoPolicy, OriginConnector, ProxyContext, StoreConfig, TlsConfigBuilder,
    UpstreamSettings,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, Issuer, KeyPair, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const ORIGIN_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 14\r\n\r\nhello, origin\n";

pub fn fast_policy() -> IoPolicy {
    IoPolicy {
        poll_interval: Duration::from_millis(50),
        first_byte_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..IoPolicy::default()
    }
}

/// Local CA written to a temp dir
pub struct TestCa {
    pub dir: TempDir,
    pub cert: Certificate,
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

impl TestCa {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "Interpose Integration CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();

        let cert_path = dir.path().join("ca_cert.pem");
        let key_path = dir.path().join("ca_key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        Self {
            dir,
            cert,
            cert_path,
            key_path,
        }
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("certs")
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            ca_cert_path: self.cert_path.clone(),
            ca_key_path: self.key_path.clone(),
            serving_key_path: None,
            cache_dir: self.cache_dir(),
        }
    }

    /// Client config trusting only this CA
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.der().clone()).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        Arc::new(config)
    }
}

/// Loopback TLS origin answering every request with [`ORIGIN_RESPONSE`]
pub struct TestOrigin {
    pub addr: SocketAddr,
    pub cert: CertificateDer<'static>,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn start() -> Self {
        // Issued by a CA the test clients never trust
        let issuer_key = KeyPair::generate().unwrap();
        let mut issuer_params = CertificateParams::default();
        issuer_params
            .distinguished_name
            .push(DnType::CommonName, "Real Origin CA");
        issuer_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let issuer = Issuer::new(issuer_params, issuer_key);

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "localhost");
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let cert = params.signed_by(&key, &issuer).unwrap();
        let cert_der = cert.der().clone();

        let server_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let acceptor = acceptor.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let Ok(mut tls) = acceptor.accept(stream).await else {
                            return;
                        };
                        let mut request = Vec::new();
                        let mut buf = [0u8; 4096];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match tls.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        requests.lock().unwrap().push(request);
                        let _ = tls.write_all(ORIGIN_RESPONSE).await;
                        let _ = tls.shutdown().await;
                    });
                }
            })
        };

        Self {
            addr,
            cert: cert_der,
            connections,
            requests,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received_requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Proxy context over `ca` with fast timings and a loopback origin leg
pub fn proxy_context(ca: &TestCa, sni_default_port: u16) -> (Arc<ProxyContext>, Arc<CertificateStore>) {
    let settings = UpstreamSettings {
        local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        timeout: Duration::from_secs(2),
        io: fast_policy(),
    };
    let connector = OriginConnector::new(&settings).unwrap();
    let store = Arc::new(CertificateStore::open(&ca.store_config(), connector.clone()).unwrap());
    let ctx = ProxyContext::new(
        store.clone(),
        TlsConfigBuilder::new(),
        connector,
        fast_policy(),
        sni_default_port,
    );
    (Arc::new(ctx), store)
}

/// Accept one connection on a fresh loopback listener
pub async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    (client, server, peer)
}

/// Read the tunnel reply up to the blank line
pub async fn read_tunnel_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "proxy closed before finishing the tunnel reply");
        reply.push(byte[0]);
    }
    reply
}

/// Handshake as `name`, send a GET and return everything the proxy sends back
pub async fn tls_get(stream: TcpStream, ca: &TestCa, name: &str) -> Vec<u8> {
    let connector = TlsConnector::from(ca.client_config());
    let server_name = ServerName::try_from(name.to_string()).unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer secret\r\nConnection: keep-alive\r\n\r\n",
        name
    );
    tls.write_all(request.as_bytes()).await.unwrap();
    tls.flush().await.unwrap();

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    response
}
