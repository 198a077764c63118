//! Interpose - transparent TLS-intercepting proxy
//!
//! Interpose terminates client TLS with a certificate forged on the fly from
//! the real origin's certificate, reads the decrypted exchange, and relays it
//! to the origin over a second TLS session.
//!
//! ## Features
//!
//! - **Tunnel and transparent modes**: the target host comes from a `CONNECT`
//!   request or from the ClientHello's SNI extension
//! - **Certificate forging**: origin identity (subject, serial, validity, SANs)
//!   re-signed by a local CA and cached on disk per hostname
//! - **Middleware pipeline**: logging and rewrite stages ahead of the origin relay
//! - **Worker pool**: a fixed number of sessions run concurrently
//!
//! ## Usage
//!
//! ```rust,no_run
//! use interpose::{Config, ConnectionDispatcher, ProxyContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let ctx = Arc::new(ProxyContext::from_config(&config)?);
//!     let dispatcher = ConnectionDispatcher::bind(&config, ctx)?;
//!     dispatcher.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - `mitm` - interception core (certificates, TLS sessions, discovery, pipeline)
//! - `server` - accept loop dispatching connections to the pool
//! - `worker_pool` - fixed-size task pool
//! - `config` - environment configuration
//! - `tls` - PEM loading helpers

// Core proxy modules
pub mod config;
pub mod server;
pub mod worker_pool;

// Interception core
pub mod mitm;

// TLS utilities
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::Config;

/// Accept loop and worker pool
pub use server::ConnectionDispatcher;
pub use worker_pool::{PoolError, WorkerPool};

/// Interception types
pub use mitm::{
    CertificateStore, ForgedCertificate, InterceptError, InterceptSession, OriginConnector,
    Pipeline, PipelineMessage, ProxyContext, SessionOutcome, Stage, StoreConfig, TlsSession,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
