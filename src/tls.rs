use rustls::pki_types::CertificateDer;
use rustls_pemfile::{certs, pkcs8_private_keys};
use secrecy::{ExposeSecret, SecretString};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::mitm::error::CertificateError;

/// Load every PEM certificate from a file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let cert_file = File::open(path).map_err(|source| CertificateError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Parse(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(CertificateError::Parse(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Parse the first certificate of a PEM buffer
pub fn parse_cert_pem(pem: &[u8]) -> Result<CertificateDer<'static>, CertificateError> {
    let mut reader = pem;
    let first = certs(&mut reader).next();
    match first {
        Some(Ok(cert)) => Ok(cert),
        Some(Err(e)) => Err(CertificateError::Parse(e.to_string())),
        None => Err(CertificateError::Parse("No certificate in PEM data".to_string())),
    }
}

/// Read a PKCS#8 private key file, keeping the PEM text secret
pub fn load_key_pem(path: &Path) -> Result<SecretString, CertificateError> {
    let pem = std::fs::read_to_string(path).map_err(|source| CertificateError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let pem = SecretString::new(pem);

    // Reject files that carry no PKCS#8 key before handing them to rcgen
    let mut reader = pem.expose_secret().as_bytes();
    let first = pkcs8_private_keys(&mut reader).next().map(|key| key.map(drop));
    match first {
        Some(Ok(())) => Ok(pem),
        Some(Err(e)) => Err(CertificateError::Parse(format!("{}: {}", path.display(), e))),
        None => Err(CertificateError::Parse(format!(
            "No private keys found in {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_certs_and_key() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let cert_file = write_temp(&cert.pem());
        let key_file = write_temp(&key.serialize_pem());

        let loaded = load_certs(cert_file.path()).unwrap();
        assert_eq!(loaded, vec![cert.der().clone()]);
        assert_eq!(parse_cert_pem(cert.pem().as_bytes()).unwrap(), *cert.der());

        let pem = load_key_pem(key_file.path()).unwrap();
        assert!(pem.expose_secret().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = load_certs(Path::new("/nonexistent/ca_cert.pem")).unwrap_err();
        assert!(matches!(err, CertificateError::Unreadable { .. }));

        let err = load_key_pem(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, CertificateError::Unreadable { .. }));
    }

    #[test]
    fn test_empty_pem_is_parse_error() {
        let file = write_temp("not a pem file\n");
        assert!(matches!(
            load_certs(file.path()),
            Err(CertificateError::Parse(_))
        ));
        assert!(matches!(
            load_key_pem(file.path()),
            Err(CertificateError::Parse(_))
        ));
        assert!(parse_cert_pem(b"").is_err());
    }
}
