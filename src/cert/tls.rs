//! PEM loading and certificate inspection

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;

use super::error::{CertError, CertResult};

/// A certificate chain and key ready for handshakes
#[derive(Debug, Clone)]
pub struct LoadedCert {
    pub key: Arc<CertifiedKey>,
    /// Expiry of the leaf certificate
    pub not_after: SystemTime,
}

/// Load a PEM certificate chain and private key from disk
///
/// # Errors
///
/// `CertError::Io` if a file cannot be read, otherwise as
/// [`load_pem`].
pub fn load_pem_files(cert_path: &Path, key_path: &Path) -> CertResult<LoadedCert> {
    let chain = std::fs::read(cert_path).map_err(|e| CertError::io(cert_path, e))?;
    let key = std::fs::read(key_path).map_err(|e| CertError::io(key_path, e))?;
    load_pem(&chain, &key, &cert_path.display().to_string())
}

/// Build a [`CertifiedKey`] from in-memory PEM
///
/// `origin` names the data in error messages.
///
/// # Errors
///
/// `CertError::Pem` when there is no certificate or no key,
/// `CertError::UnsupportedKey` when the key type cannot sign,
/// `CertError::InvalidCertificate` when the leaf cannot be parsed.
pub fn load_pem(chain_pem: &[u8], key_pem: &[u8], origin: &str) -> CertResult<LoadedCert> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(chain_pem))
        .collect::<Result<_, _>>()
        .map_err(|e| CertError::pem(origin, e.to_string()))?;
    let leaf = certs
        .first()
        .ok_or_else(|| CertError::pem(origin, "no certificates found"))?;
    let not_after = not_after(leaf)?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|e| CertError::pem(origin, e.to_string()))?
        .ok_or_else(|| CertError::pem(origin, "no private key found"))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::UnsupportedKey(e.to_string()))?;

    Ok(LoadedCert {
        key: Arc::new(CertifiedKey::new(certs, signing_key)),
        not_after,
    })
}

/// Expiry time of a DER certificate
///
/// # Errors
///
/// `CertError::InvalidCertificate` if the DER cannot be parsed.
pub fn not_after(der: &CertificateDer<'_>) -> CertResult<SystemTime> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|e| CertError::InvalidCertificate(e.to_string()))?;
    let secs = cert.validity().not_after.timestamp();
    Ok(u64::try_from(secs).map_or(UNIX_EPOCH, |s| UNIX_EPOCH + Duration::from_secs(s)))
}

/// Install ring as the process-wide rustls provider unless one is set
///
/// `instant-acme` builds its HTTPS client from the process default.
pub fn install_default_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Point at which a certificate expiring at `not_after` should be renewed
#[must_use]
pub fn renewal_deadline(not_after: SystemTime, renew_before: Duration) -> SystemTime {
    // SystemTime can sit before the epoch on unix; clamp there
    not_after
        .checked_sub(renew_before)
        .map_or(UNIX_EPOCH, |t| t.max(UNIX_EPOCH))
}

#[cfg(test)]
pub(crate) mod test_certs {
    use rcgen::{CertificateParams, KeyPair};
    use time::{Duration as TimeDuration, OffsetDateTime};

    /// Self-signed chain and key PEM valid for `days` from now
    pub(crate) fn self_signed_pem(name: &str, days: i64) -> (String, String) {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(1);
        params.not_after = now + TimeDuration::days(days);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}
