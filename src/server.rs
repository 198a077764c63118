//! Connection dispatcher
//!
//! Accepts TCP connections on the configured address and hands each one to
//! the worker pool as a single intercept session.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::mitm::intercept::{InterceptSession, ProxyContext, SessionOutcome};
use crate::worker_pool::WorkerPool;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ConnectionDispatcher {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    workers: usize,
    next_session_id: AtomicU64,
}

impl ConnectionDispatcher {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(config: &Config, ctx: Arc<ProxyContext>) -> Result<Self> {
        let addr = SocketAddr::new(config.listen_ip, config.listen_port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create listening socket")?;

        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind {}", addr))?;
        let listener = socket
            .listen(config.listen_backlog)
            .with_context(|| format!("Failed to listen on {}", addr))?;

        Ok(Self {
            listener,
            ctx,
            workers: config.workers,
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listener has no local address")
    }

    /// Accept until `shutdown` resolves, then stop the pool
    ///
    /// Sessions already running on a worker finish; accepted connections
    /// still waiting in the queue are dropped.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let pool = WorkerPool::start(self.workers);
        info!(
            addr = %self.local_addr()?,
            workers = pool.size(),
            "Listening for connections"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutting down dispatcher...");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id, peer = %peer, "Accepted connection");

                        let ctx = Arc::clone(&self.ctx);
                        let task = async move {
                            let mut session = InterceptSession::new(session_id, Some(peer), ctx);
                            match session.run(stream).await {
                                Ok(SessionOutcome::Completed { .. }) => {}
                                Ok(SessionOutcome::Dropped) => {
                                    debug!(session_id, "Connection dropped without handshake");
                                }
                                Err(e) => error!(
                                    session_id,
                                    peer = %peer,
                                    error = %e,
                                    kind = %e.kind(),
                                    "Session failed"
                                ),
                            }
                        };

                        if let Err(e) = pool.submit(task) {
                            warn!(session_id, error = %e, "Connection not dispatched");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        pool.shutdown().await;

        let stats = self.ctx.store.stats();
        info!(
            cache_hits = stats.hits,
            forged = stats.forged,
            "Dispatcher stopped"
        );
        Ok(())
    }
}
