//! Error types for doh-autoproxy
//!
//! This module defines the top-level error hierarchy. Each subsystem owns
//! its own error enum (`GeoError`, `DnsError`, `CertError`) and the ones
//! that have no natural home elsewhere (`ConfigError`, `RuleError`) live
//! here. All errors carry a recovery hint.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cert::CertError;
use crate::dns::DnsError;
use crate::geo::GeoError;

/// Top-level error type for doh-autoproxy
#[derive(Debug, Error)]
pub enum AutoproxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Geo database errors (missing, corrupt, download failure)
    #[error("Geo data error: {0}")]
    Geo(#[from] GeoError),

    /// Override list and rule list errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// DNS protocol and upstream errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Certificate management errors
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AutoproxyError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Rule(_) => false,
            Self::Geo(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Cert(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Errors raised while parsing override/rule files or building matchers
#[derive(Debug, Error)]
pub enum RuleError {
    /// A line in a hosts or rule file could not be parsed
    #[error("{path}:{line}: {reason}")]
    Syntax {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Invalid regular expression
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    /// Invalid CIDR literal
    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// A rule or override names a policy that is not configured
    #[error("Unknown policy '{policy}' referenced by {source_name}")]
    UnknownPolicy { policy: String, source_name: String },

    /// Automaton construction failed
    #[error("Failed to build matcher: {0}")]
    BuildError(String),

    /// I/O error while reading a list file
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RuleError {
    /// Create a syntax error for a given file position
    pub fn syntax(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::Syntax {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Create an invalid regex error
    pub fn invalid_regex(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRegex {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown policy error
    pub fn unknown_policy(policy: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self::UnknownPolicy {
            policy: policy.into(),
            source_name: source_name.into(),
        }
    }
}

/// Type alias for Result with `AutoproxyError`
pub type Result<T> = std::result::Result<T, AutoproxyError>;
