//! Intercept session - drives one client connection end to end
//!
//! Flow:
//! 1. Discover the target hostname (tunnel request or SNI)
//! 2. Complete the frontend handshake with the forged certificate
//! 3. Read the decrypted request and run it through the pipeline
//! 4. Write the origin's reply back and close both sessions

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::certificate_store::CertificateStore;
use super::discovery::{AcceptedFrontend, FrontendAcceptor, HandshakeContext, HostnameResolver};
use super::error::{InterceptError, Result};
use super::origin::OriginConnector;
use super::pipeline::{Pipeline, PipelineMessage, Stage};
use super::stages::{HttpRewriteStage, LogHttpStage, OriginRelayStage};
use super::tls_config::{FrontendTls, TlsConfigBuilder};
use super::tls_session::{IoPolicy, TlsSession};
use crate::config::Config;

/// Shared state every session reads from
pub struct ProxyContext {
    pub store: Arc<CertificateStore>,
    pub frontend_tls: Arc<FrontendTls>,
    pub connector: OriginConnector,
    pub frontend_policy: IoPolicy,
    pub sni_default_port: u16,
}

impl ProxyContext {
    /// Load CA material and build both TLS legs from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let connector = OriginConnector::new(&config.upstream_settings())?;
        let store = CertificateStore::open(&config.store_config(), connector.clone())?;
        let builder = TlsConfigBuilder::new().cipher_list(&config.cipher_suites)?;
        debug!(
            cipher_list = %config.cipher_suites,
            cipher_suites = builder.cipher_suite_count(),
            "Frontend cipher suites selected"
        );

        Ok(Self::new(
            Arc::new(store),
            builder,
            connector,
            config.frontend_policy(),
            config.sni_default_port,
        ))
    }

    pub fn new(
        store: Arc<CertificateStore>,
        builder: TlsConfigBuilder,
        connector: OriginConnector,
        frontend_policy: IoPolicy,
        sni_default_port: u16,
    ) -> Self {
        let frontend_tls = Arc::new(FrontendTls::new(
            builder,
            store.serving_key(),
            store.ca_certificate().clone(),
        ));

        Self {
            store,
            frontend_tls,
            connector,
            frontend_policy,
            sni_default_port,
        }
    }

    fn acceptor(&self) -> FrontendAcceptor {
        let resolver: Arc<dyn HostnameResolver> = self.store.clone();
        FrontendAcceptor::new(
            resolver,
            Arc::clone(&self.frontend_tls),
            self.frontend_policy,
            self.sni_default_port,
        )
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHostname,
    HandshakeReady,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingHostname => "awaiting-hostname",
            SessionState::HandshakeReady => "handshake-ready",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How a session ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// One exchange relayed
    Completed {
        host: String,
        port: u16,
        request_bytes: usize,
        response_bytes: usize,
    },
    /// No hostname could be discovered; closed before any handshake
    Dropped,
}

/// Build the interception chain for one exchange
pub fn build_pipeline(
    session_id: u64,
    connector: OriginConnector,
    host: &str,
    port: u16,
    backend: Option<TlsSession>,
) -> Pipeline {
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(LogHttpStage::new(session_id)),
        Box::new(HttpRewriteStage),
        Box::new(OriginRelayStage::new(connector, host, port, backend)),
    ];
    Pipeline::new(stages)
}

/// One intercepted client connection
///
/// States advance `AwaitingHostname → HandshakeReady → Active → Closed`.
/// `HandshakeReady` is entered once a certificate is installed, before the
/// frontend handshake runs; `Active` once that handshake completes.
pub struct InterceptSession {
    id: u64,
    peer: Option<SocketAddr>,
    ctx: Arc<ProxyContext>,
    state: SessionState,
    history: Vec<SessionState>,
}

impl InterceptSession {
    pub fn new(id: u64, peer: Option<SocketAddr>, ctx: Arc<ProxyContext>) -> Self {
        Self {
            id,
            peer,
            ctx,
            state: SessionState::AwaitingHostname,
            history: vec![SessionState::AwaitingHostname],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, oldest first
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = self.id, from = %self.state, to = %next, "session state");
        self.state = next;
        self.history.push(next);
    }

    /// Run the connection to completion
    ///
    /// Both TLS sessions are released on every path.
    pub async fn run(&mut self, mut stream: TcpStream) -> Result<SessionOutcome> {
        info!(session_id = self.id, peer = ?self.peer, "Session opened");

        let acceptor = self.ctx.acceptor();
        let mut handshake = HandshakeContext::new(self.id, self.peer);

        if let Err(e) = acceptor.take_tunnel(&mut stream, &mut handshake).await {
            return self.fail(&mut handshake, e).await;
        }
        if handshake.has_certificate() {
            self.transition(SessionState::HandshakeReady);
        }

        let pending = match acceptor.client_hello(stream, &mut handshake).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                self.transition(SessionState::Closed);
                return Ok(SessionOutcome::Dropped);
            }
            Err(e) => return self.fail(&mut handshake, e).await,
        };
        if self.state == SessionState::AwaitingHostname {
            self.transition(SessionState::HandshakeReady);
        }

        let AcceptedFrontend {
            session: mut frontend,
            host,
            port,
        } = match acceptor.complete(pending, &handshake).await {
            Ok(accepted) => accepted,
            Err(e) => return self.fail(&mut handshake, e).await,
        };
        self.transition(SessionState::Active);

        let result = self
            .exchange(&mut frontend, &host, port, handshake.origin.take())
            .await;

        // The handshake succeeded, so the frontend gets a close_notify
        frontend.close(true).await;
        self.transition(SessionState::Closed);

        match &result {
            Ok(SessionOutcome::Completed {
                request_bytes,
                response_bytes,
                ..
            }) => info!(
                session_id = self.id,
                host = %host,
                port,
                request_bytes,
                response_bytes,
                "Session complete"
            ),
            Ok(SessionOutcome::Dropped) => {}
            Err(e) => debug!(
                session_id = self.id,
                host = %host,
                port,
                error = %e,
                states = ?self.history,
                "Exchange aborted"
            ),
        }
        result
    }

    /// Release the fetch connection and close before the frontend handshake finished
    async fn fail(
        &mut self,
        handshake: &mut HandshakeContext,
        error: InterceptError,
    ) -> Result<SessionOutcome> {
        if let Some(mut origin) = handshake.origin.take() {
            origin.close(false).await;
        }
        self.transition(SessionState::Closed);
        debug!(
            session_id = self.id,
            error = %error,
            states = ?self.history,
            "Session failed before the exchange"
        );
        Err(error)
    }

    async fn exchange(
        &mut self,
        frontend: &mut TlsSession,
        host: &str,
        port: u16,
        backend: Option<TlsSession>,
    ) -> Result<SessionOutcome> {
        let request = frontend.read().await?;
        if request.is_empty() {
            return Err(InterceptError::pipeline("client sent no data"));
        }

        let request_bytes = request.len();
        let mut pipeline = build_pipeline(self.id, self.ctx.connector.clone(), host, port, backend);
        debug!(session_id = self.id, stages = ?pipeline.stage_names(), "Pipeline built");

        let response: Bytes = match pipeline.process(PipelineMessage::Payload(request)).await {
            PipelineMessage::Payload(response) => response,
            PipelineMessage::Ok | PipelineMessage::Empty => Bytes::new(),
            PipelineMessage::Error(e) => return Err(InterceptError::Pipeline(e)),
        };

        if !response.is_empty() {
            frontend.write(&response).await?;
        }

        Ok(SessionOutcome::Completed {
            host: host.to_string(),
            port,
            request_bytes,
            response_bytes: response.len(),
        })
    }
}
