//! Error types for geo database loading and provisioning

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the geo database store and the file provisioner
#[derive(Debug, Error)]
pub enum GeoError {
    /// The database file is absent or zero length
    ///
    /// The caller may fetch a replacement and retry.
    #[error("Geo database {path} is missing or empty")]
    MissingFile { path: PathBuf },

    /// The database container could not be decoded
    #[error("Geo database {path} is corrupt: {reason}")]
    CorruptDatabase { path: PathBuf, reason: String },

    /// A file is missing and no download URL is configured
    #[error("Geo database {path} does not exist and no download URL is configured")]
    NoDownloadSource { path: PathBuf },

    /// Fetching a replacement file failed
    #[error("Failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// A regex pattern in a category could not be compiled
    #[error("Invalid pattern '{pattern}' in category '{tag}': {reason}")]
    InvalidPattern {
        tag: String,
        pattern: String,
        reason: String,
    },

    /// I/O error reading or replacing a database file
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl GeoError {
    /// Only a missing file can be fixed without operator action (by fetching)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingFile { .. } | Self::DownloadFailed { .. })
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptDatabase {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn download(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_vs_corrupt() {
        let missing = GeoError::MissingFile {
            path: "geoip.dat".into(),
        };
        assert!(missing.is_recoverable());
        assert!(missing.to_string().contains("missing or empty"));

        let corrupt = GeoError::corrupt("geosite.dat", "invalid wire type");
        assert!(!corrupt.is_recoverable());
        assert!(corrupt.to_string().contains("invalid wire type"));
    }
}
