//! Built-in pipeline stages
//!
//! The interception chain is `log-http → http-rewrite → origin-relay`.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::error::{InterceptError, Result};
use super::http_parser::{parse_http1_request, HttpMessage};
use super::logging::RedactedHeaders;
use super::origin::OriginConnector;
use super::pipeline::{Next, PipelineMessage, Stage};
use super::tls_session::TlsSession;

/// Logs each request and the response that comes back
pub struct LogHttpStage {
    session_id: u64,
}

impl LogHttpStage {
    pub fn new(session_id: u64) -> Self {
        Self { session_id }
    }

    fn log(&self, data: &[u8]) {
        match HttpMessage::parse(data) {
            Ok(HttpMessage::Request(req)) => info!(
                session_id = self.session_id,
                method = %req.method,
                target = %req.target,
                host = req.host().as_deref().unwrap_or("-"),
                port = req.port(),
                content_type = req.content_type().unwrap_or("-"),
                headers = %RedactedHeaders(&req.headers),
                content_length = ?req.content_length(),
                body_bytes = req.body.len(),
                "Send request"
            ),
            Ok(HttpMessage::Response(resp)) => info!(
                session_id = self.session_id,
                status = resp.status.as_u16(),
                reason = %resp.reason,
                content_type = resp.content_type().unwrap_or("-"),
                headers = %RedactedHeaders(&resp.headers),
                content_length = ?resp.content_length(),
                body_bytes = resp.body.len(),
                "Got response"
            ),
            Err(e) => debug!(
                session_id = self.session_id,
                bytes = data.len(),
                error = %e,
                "Unparsable HTTP message"
            ),
        }
    }
}

#[async_trait]
impl Stage for LogHttpStage {
    fn name(&self) -> &'static str {
        "log-http"
    }

    async fn process(&mut self, msg: PipelineMessage, next: Next<'_>) -> PipelineMessage {
        if let PipelineMessage::Payload(request) = &msg {
            self.log(request);
        }

        let result = next.forward(msg).await;

        if let PipelineMessage::Payload(response) = &result {
            self.log(response);
        }
        result
    }
}

/// Forces `Connection: close` on requests so the origin ends the exchange
pub struct HttpRewriteStage;

impl HttpRewriteStage {
    fn rewrite(data: &[u8]) -> std::result::Result<Bytes, String> {
        let mut request = parse_http1_request(data).map_err(|e| e.to_string())?;
        request.headers.set("connection", "close");
        Ok(request.to_bytes())
    }
}

#[async_trait]
impl Stage for HttpRewriteStage {
    fn name(&self) -> &'static str {
        "http-rewrite"
    }

    async fn process(&mut self, msg: PipelineMessage, next: Next<'_>) -> PipelineMessage {
        match msg {
            PipelineMessage::Payload(data) => match Self::rewrite(&data) {
                Ok(rewritten) => next.forward(PipelineMessage::Payload(rewritten)).await,
                Err(e) => PipelineMessage::error(format!("{}: {}", self.name(), e)),
            },
            PipelineMessage::Error(e) => PipelineMessage::Error(e),
            other => next.forward(other).await,
        }
    }
}

/// Terminal stage relaying the payload to the origin over a backend session
pub struct OriginRelayStage {
    connector: OriginConnector,
    host: String,
    port: u16,
    backend: Option<TlsSession>,
}

impl OriginRelayStage {
    /// `backend` is reused when present, otherwise a session is opened on demand
    pub fn new(
        connector: OriginConnector,
        host: impl Into<String>,
        port: u16,
        backend: Option<TlsSession>,
    ) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            backend,
        }
    }

    async fn relay(&mut self, payload: &[u8]) -> Result<Bytes> {
        let mut backend = match self.backend.take() {
            Some(session) if !session.is_closed() => session,
            _ => self.connector.connect(&self.host, self.port).await?,
        };

        let outcome = match backend.write(payload).await {
            Ok(_) => backend.read().await,
            Err(e) => Err(e),
        };
        backend.close(outcome.is_ok()).await;

        let response = outcome?;
        debug!(host = %self.host, port = self.port, bytes = response.len(), "Origin replied");
        Ok(response)
    }
}

#[async_trait]
impl Stage for OriginRelayStage {
    fn name(&self) -> &'static str {
        "origin-relay"
    }

    async fn process(&mut self, msg: PipelineMessage, _next: Next<'_>) -> PipelineMessage {
        let payload = match msg {
            PipelineMessage::Payload(payload) => payload,
            PipelineMessage::Error(e) => return PipelineMessage::Error(e),
            other => {
                return PipelineMessage::error(format!(
                    "{} expects a payload, got {}",
                    self.name(),
                    other
                ))
            }
        };

        match self.relay(&payload).await {
            Ok(response) if response.is_empty() => PipelineMessage::Empty,
            Ok(response) => PipelineMessage::Payload(response),
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, kind = %e.kind(), "Origin relay failed");
                PipelineMessage::error(relay_error(&e))
            }
        }
    }
}

fn relay_error(err: &InterceptError) -> String {
    format!("origin relay failed: {}", err)
}
