//! Certificate lifecycle errors

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias for certificate operations
pub type CertResult<T> = std::result::Result<T, CertError>;

/// Errors raised while loading, issuing or serving certificates
#[derive(Debug, Error)]
pub enum CertError {
    /// Reading or writing a certificate/key/account file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// PEM data did not contain what was expected
    #[error("Invalid PEM in {origin}: {reason}")]
    Pem { origin: String, reason: String },

    /// Private key type not supported by the TLS provider
    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),

    /// X.509 parsing failed
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// ACME protocol or CA error
    #[error("ACME error: {0}")]
    Acme(String),

    /// A step of the issuance flow did not complete in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// CSR or key generation failed
    #[error("Key generation failed: {0}")]
    KeyGen(String),

    /// HTTP-01 responder could not start
    #[error("Challenge responder error: {0}")]
    Challenge(String),

    /// Invalid certificate configuration
    #[error("Certificate configuration error: {0}")]
    Config(String),
}

impl CertError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn pem(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Pem {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    pub fn acme(err: impl std::fmt::Display) -> Self {
        Self::Acme(err.to_string())
    }

    /// Whether retrying later may succeed
    ///
    /// CA and network problems are transient; bad files and unsupported
    /// keys need an operator.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Acme(_) | Self::Timeout(_) | Self::Challenge(_) => true,
            Self::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            Self::Pem { .. }
            | Self::UnsupportedKey(_)
            | Self::InvalidCertificate(_)
            | Self::KeyGen(_)
            | Self::Config(_) => false,
        }
    }
}
