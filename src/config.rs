use anyhow::{Context, Result};
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mitm::certificate_store::StoreConfig;
use crate::mitm::origin::UpstreamSettings;
use crate::mitm::tls_config::select_cipher_suites;
use crate::mitm::tls_session::{IoPolicy, DEFAULT_MAX_READ_BYTES};

#[derive(Debug, Clone)]
pub struct Config {
    // Listener
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub listen_backlog: u32,

    // Frontend TLS
    pub cipher_suites: String,

    // CA material and certificate cache
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub serving_key_path: Option<PathBuf>,
    pub cert_cache_dir: PathBuf,

    // Worker pool
    pub workers: usize,

    // Origin connections
    pub local_address: IpAddr,
    pub upstream_timeout_ms: u64,

    // Read loop and handshake timing
    pub read_poll_ms: u64,
    pub first_byte_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Cap on one read burst
    pub max_read_bytes: usize,

    // Port assumed for origins discovered through SNI
    pub sni_default_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let listen_ip = IpAddr::from([0, 0, 0, 0]);
        Self {
            listen_ip,
            listen_port: 5443,
            listen_backlog: 128,
            cipher_suites: "ALL".to_string(),
            ca_cert_path: PathBuf::from("./scerts/ca_cert.pem"),
            ca_key_path: PathBuf::from("./scerts/key.pem"),
            serving_key_path: None,
            cert_cache_dir: PathBuf::from("./certs"),
            workers: 10,
            local_address: listen_ip,
            upstream_timeout_ms: 2000,
            read_poll_ms: 1000,
            first_byte_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            sni_default_port: 443,
        }
    }
}

/// Read `name`, falling back to `default` when unset
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let listen_ip = var_or("PROXY_LISTEN_IP", defaults.listen_ip)?;
        let listen_port = var_or("PROXY_LISTEN_PORT", defaults.listen_port)?;
        let listen_backlog = var_or("PROXY_LISTEN_BACKLOG", defaults.listen_backlog)?;

        let cipher_suites =
            env::var("PROXY_CIPHER_SUITES").unwrap_or_else(|_| defaults.cipher_suites.clone());
        select_cipher_suites(&cipher_suites).context("Invalid PROXY_CIPHER_SUITES")?;

        let ca_cert_path = var_or("PROXY_CA_CERT_PATH", defaults.ca_cert_path)?;
        let ca_key_path = var_or("PROXY_CA_KEY_PATH", defaults.ca_key_path)?;
        let serving_key_path = env::var("PROXY_SERVING_KEY_PATH")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let cert_cache_dir = var_or("PROXY_CERT_CACHE_DIR", defaults.cert_cache_dir)?;

        let workers: usize = var_or("PROXY_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(anyhow::anyhow!("PROXY_WORKERS must be at least 1"));
        }

        // Origin sockets bind to the listen address unless told otherwise
        let local_address = var_or("PROXY_LOCAL_ADDRESS", listen_ip)?;
        let upstream_timeout_ms = var_or("PROXY_UPSTREAM_TIMEOUT_MS", defaults.upstream_timeout_ms)?;

        let read_poll_ms = var_or("PROXY_READ_POLL_MS", defaults.read_poll_ms)?;
        let first_byte_timeout_ms =
            var_or("PROXY_FIRST_BYTE_TIMEOUT_MS", defaults.first_byte_timeout_ms)?;
        let handshake_timeout_ms =
            var_or("PROXY_HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout_ms)?;
        if read_poll_ms == 0 {
            return Err(anyhow::anyhow!("PROXY_READ_POLL_MS must be greater than 0"));
        }
        let max_read_bytes = var_or("PROXY_MAX_READ_BYTES", defaults.max_read_bytes)?;
        if max_read_bytes == 0 {
            return Err(anyhow::anyhow!("PROXY_MAX_READ_BYTES must be greater than 0"));
        }

        let sni_default_port = var_or("PROXY_SNI_DEFAULT_PORT", defaults.sni_default_port)?;

        tracing::debug!(
            listen_ip = %listen_ip,
            listen_port,
            workers,
            cache_dir = %cert_cache_dir.display(),
            "Configuration loaded"
        );

        Ok(Config {
            listen_ip,
            listen_port,
            listen_backlog,
            cipher_suites,
            ca_cert_path,
            ca_key_path,
            serving_key_path,
            cert_cache_dir,
            workers,
            local_address,
            upstream_timeout_ms,
            read_poll_ms,
            first_byte_timeout_ms,
            handshake_timeout_ms,
            max_read_bytes,
            sni_default_port,
        })
    }

    /// Timing of frontend sessions
    pub fn frontend_policy(&self) -> IoPolicy {
        IoPolicy {
            poll_interval: Duration::from_millis(self.read_poll_ms),
            first_byte_timeout: Duration::from_millis(self.first_byte_timeout_ms),
            write_timeout: Duration::from_millis(self.upstream_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_read_bytes: self.max_read_bytes,
        }
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            local_address: Some(self.local_address),
            timeout: Duration::from_millis(self.upstream_timeout_ms),
            io: self.frontend_policy(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            ca_cert_path: self.ca_cert_path.clone(),
            ca_key_path: self.ca_key_path.clone(),
            serving_key_path: self.serving_key_path.clone(),
            cache_dir: self.cert_cache_dir.clone(),
        }
    }
}
