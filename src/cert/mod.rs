//! Certificate lifecycle for the TLS front-ends
//!
//! - [`CertManager`]: holds the served certificate, implements
//!   `ResolvesServerCert` and runs renewal
//! - [`AcmeIssuer`]: ACME (`instant-acme`) issuance with HTTP-01
//! - [`ChallengeServer`]: the port-80 responder for HTTP-01 tokens, which
//!   also redirects plain HTTP to HTTPS
//! - [`load_pem_files`]: the static `tls.cert_file` / `tls.key_file` pair

mod acme;
mod challenge;
mod error;
mod manager;
mod tls;

use std::io::Write;
use std::path::Path;

pub use acme::{AcmeIssuer, CertIssuer, IssuedCert};
pub use challenge::{ChallengeServer, ChallengeStore, CHALLENGE_PATH_PREFIX};
pub use error::{CertError, CertResult};
pub use manager::{
    CertManager, CertManagerBuilder, CertSource, CertState, CertStatus, DEFAULT_RENEW_BEFORE, DEFAULT_RETRY_AFTER,
};
pub use tls::{install_default_provider, load_pem, load_pem_files, not_after, renewal_deadline, LoadedCert};

/// Write a file readable only by the owner, replacing it atomically
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> CertResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CertError::io(parent, e))?;
    }

    let tmp = path.with_extension("tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp).map_err(|e| CertError::io(&tmp, e))?;
    file.write_all(contents).map_err(|e| CertError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CertError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| CertError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_private_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/account.json");
        write_private(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
