//! Certificate store - forges origin certificates under the local CA
//!
//! Forged certificates copy the origin's identity (subject, serial, validity
//! window, subject alternative names) and are re-issued by the local CA. Each
//! one is persisted as `<cache_dir>/<hostname>` in PEM form; a present file is
//! served as-is without contacting the origin. Entries never expire.

use rcgen::string::{Ia5String, PrintableString};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, DnValue, Issuer, KeyPair, SanType,
    SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use secrecy::ExposeSecret;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use x509_parser::der_parser::asn1_rs::Tag;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;
use x509_parser::x509::X509Name;

use super::error::{CertificateError, Result};
use super::origin::OriginConnector;
use super::tls_config::SniUtils;
use super::tls_session::TlsSession;
use crate::tls::{load_certs, load_key_pem, parse_cert_pem};

/// Paths the store loads from and writes to
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// Key embedded in forged certificates; the CA key when unset
    pub serving_key_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
}

/// Certificate served for one hostname
#[derive(Debug)]
pub struct ForgedCertificate {
    pub cert: CertificateDer<'static>,
    /// Backend session opened to fetch the origin certificate (cache misses only)
    pub origin: Option<TlsSession>,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Certificates served from the cache directory
    pub hits: u64,
    /// Certificates cloned from an origin and signed
    pub forged: u64,
}

/// Filesystem-backed certificate store
pub struct CertificateStore {
    issuer: Issuer<'static, KeyPair>,
    ca_cert: CertificateDer<'static>,
    serving_key: KeyPair,
    cache_dir: PathBuf,
    connector: OriginConnector,
    hits: AtomicU64,
    forged: AtomicU64,
}

impl CertificateStore {
    /// Load CA material and prepare the cache directory
    pub fn open(config: &StoreConfig, connector: OriginConnector) -> Result<Self> {
        let ca_cert = load_certs(&config.ca_cert_path)?
            .into_iter()
            .next()
            .ok_or_else(|| CertificateError::Parse("CA certificate missing".to_string()))?;

        let ca_key = load_key_pair(&config.ca_key_path)?;
        let issuer = Issuer::from_ca_cert_der(&ca_cert, ca_key)
            .map_err(|e| CertificateError::Parse(format!("CA certificate: {}", e)))?;

        let serving_key_path = config
            .serving_key_path
            .as_deref()
            .unwrap_or(&config.ca_key_path);
        let serving_key = load_key_pair(serving_key_path)?;

        std::fs::create_dir_all(&config.cache_dir).map_err(|source| {
            CertificateError::Persist {
                path: config.cache_dir.clone(),
                source,
            }
        })?;

        info!(
            ca_cert = %config.ca_cert_path.display(),
            cache_dir = %config.cache_dir.display(),
            separate_serving_key = config.serving_key_path.is_some(),
            "Certificate store ready"
        );

        Ok(Self {
            issuer,
            ca_cert,
            serving_key,
            cache_dir: config.cache_dir.clone(),
            connector,
            hits: AtomicU64::new(0),
            forged: AtomicU64::new(0),
        })
    }

    /// Certificate for `hostname`, from the cache or forged from the origin at `hostname:port`
    ///
    /// Hostnames are matched case-insensitively; the cache key is the lowercase form.
    pub async fn certificate_for(&self, hostname: &str, port: u16) -> Result<ForgedCertificate> {
        let hostname = hostname.to_ascii_lowercase();
        let hostname = hostname.as_str();
        validate_cache_hostname(hostname)?;

        if let Some(cert) = self.load_cached(hostname).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(host = %hostname, "Certificate cache hit");
            return Ok(ForgedCertificate { cert, origin: None });
        }

        let origin = self.connector.connect(hostname, port).await?;
        let origin_cert = origin
            .peer_certificate()
            .ok_or_else(|| CertificateError::NoPeerCertificate(format!("{}:{}", hostname, port)))?;

        let forged = self.forge(&origin_cert)?;
        self.verify_issued(forged.der())?;
        let path = self.persist(hostname, forged.pem()).await?;

        self.forged.fetch_add(1, Ordering::Relaxed);
        info!(host = %hostname, port, path = %path.display(), "Forged certificate");

        Ok(ForgedCertificate {
            cert: forged.der().clone(),
            origin: Some(origin),
        })
    }

    /// Cached certificate for `hostname`, `None` when absent
    pub async fn load_cached(&self, hostname: &str) -> Result<Option<CertificateDer<'static>>> {
        let hostname = hostname.to_ascii_lowercase();
        validate_cache_hostname(&hostname)?;
        let path = self.cache_path(&hostname);

        let pem = match tokio::fs::read(&path).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CertificateError::Unreadable { path, source }.into()),
        };

        Ok(Some(parse_cert_pem(&pem)?))
    }

    /// Clone an origin certificate's identity and sign it with the CA
    pub fn forge(&self, origin: &CertificateDer<'_>) -> std::result::Result<Certificate, CertificateError> {
        let mut params = origin_identity(origin)?;
        params.use_authority_key_identifier_extension = true;

        params
            .signed_by(&self.serving_key, &self.issuer)
            .map_err(|e| CertificateError::Sign(e.to_string()))
    }

    /// Check that `cert` was issued by this store's CA
    pub fn verify_issued(&self, cert: &CertificateDer<'_>) -> std::result::Result<(), CertificateError> {
        verify_issued_by(cert, &self.ca_cert)
    }

    pub fn ca_certificate(&self) -> &CertificateDer<'static> {
        &self.ca_cert
    }

    /// PKCS#8 form of the key embedded in every forged certificate
    pub fn serving_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.serving_key.serialize_der()))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            forged: self.forged.load(Ordering::Relaxed),
        }
    }

    fn cache_path(&self, hostname: &str) -> PathBuf {
        self.cache_dir.join(hostname)
    }

    /// Write the entry atomically so readers never see partial PEM
    async fn persist(&self, hostname: &str, pem: String) -> std::result::Result<PathBuf, CertificateError> {
        let path = self.cache_path(hostname);
        let dir = self.cache_dir.clone();

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(pem.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r);

        match written {
            Ok(()) => Ok(path),
            Err(source) => Err(CertificateError::Persist { path, source }),
        }
    }
}

/// Verify that `cert` names `ca` as issuer and carries a valid CA signature
pub fn verify_issued_by(
    cert: &CertificateDer<'_>,
    ca: &CertificateDer<'_>,
) -> std::result::Result<(), CertificateError> {
    let (_, leaf) = parse_x509_certificate(cert.as_ref())
        .map_err(|e| CertificateError::Parse(format!("issued certificate: {}", e)))?;
    let (_, authority) = parse_x509_certificate(ca.as_ref())
        .map_err(|e| CertificateError::Parse(format!("CA certificate: {}", e)))?;

    if leaf.issuer().as_raw() != authority.subject().as_raw() {
        return Err(CertificateError::Verify(format!(
            "issuer '{}' does not match CA subject '{}'",
            leaf.issuer(),
            authority.subject()
        )));
    }

    leaf.verify_signature(Some(authority.public_key()))
        .map_err(|e| CertificateError::Verify(format!("signature check failed: {}", e)))
}

/// Subject, serial, validity window and SANs of an origin certificate
fn origin_identity(der: &CertificateDer<'_>) -> std::result::Result<CertificateParams, CertificateError> {
    let parse_err = |msg: String| CertificateError::Parse(format!("origin certificate: {}", msg));

    let (_, cert) = parse_x509_certificate(der.as_ref()).map_err(|e| parse_err(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(cert.subject()).map_err(parse_err)?;
    params.serial_number = Some(SerialNumber::from_slice(cert.raw_serial()));
    params.not_before = cert.validity().not_before.to_datetime();
    params.not_after = cert.validity().not_after.to_datetime();

    if let Some(san) = cert
        .subject_alternative_name()
        .map_err(|e| parse_err(e.to_string()))?
    {
        params.subject_alt_names = san
            .value
            .general_names
            .iter()
            .map(san_type)
            .collect::<std::result::Result<_, _>>()
            .map_err(parse_err)?;
    }

    Ok(params)
}

fn distinguished_name(name: &X509Name<'_>) -> std::result::Result<DistinguishedName, String> {
    let mut dn = DistinguishedName::new();

    for attr in name.iter_attributes() {
        let oid: Vec<u64> = attr
            .attr_type()
            .iter()
            .ok_or_else(|| format!("subject attribute OID {} out of range", attr.attr_type()))?
            .collect();
        let text = attr
            .as_str()
            .map_err(|e| format!("subject attribute {}: {}", attr.attr_type(), e))?;

        let value = match attr.attr_value().tag() {
            Tag::PrintableString => PrintableString::try_from(text)
                .map(DnValue::PrintableString)
                .map_err(|e| e.to_string())?,
            Tag::Ia5String => Ia5String::try_from(text)
                .map(DnValue::Ia5String)
                .map_err(|e| e.to_string())?,
            _ => DnValue::Utf8String(text.to_string()),
        };
        dn.push(DnType::from_oid(&oid), value);
    }

    Ok(dn)
}

fn san_type(name: &GeneralName<'_>) -> std::result::Result<SanType, String> {
    let ia5 = |s: &str| Ia5String::try_from(s).map_err(|e| e.to_string());

    match name {
        GeneralName::DNSName(s) => Ok(SanType::DnsName(ia5(s)?)),
        GeneralName::RFC822Name(s) => Ok(SanType::Rfc822Name(ia5(s)?)),
        GeneralName::URI(s) => Ok(SanType::URI(ia5(s)?)),
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes[..].try_into().map_err(|_| "IP SAN".to_string())?;
                Ok(SanType::IpAddress(IpAddr::from(octets)))
            }
            16 => {
                let octets: [u8; 16] = bytes[..].try_into().map_err(|_| "IP SAN".to_string())?;
                Ok(SanType::IpAddress(IpAddr::from(octets)))
            }
            n => Err(format!("IP SAN of {} bytes", n)),
        },
        other => Err(format!("unsupported subject alternative name {:?}", other)),
    }
}

/// Hostnames double as cache file names
fn validate_cache_hostname(hostname: &str) -> std::result::Result<(), CertificateError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':');

    if !SniUtils::validate_hostname(hostname) || hostname.contains("..") || !hostname.chars().all(allowed)
    {
        return Err(CertificateError::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}

fn load_key_pair(path: &Path) -> std::result::Result<KeyPair, CertificateError> {
    let pem = load_key_pem(path)?;
    KeyPair::from_pem(pem.expose_secret())
        .map_err(|e| CertificateError::Parse(format!("{}: {}", path.display(), e)))
}
