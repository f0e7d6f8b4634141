//! Error types for the DNS layer
//!
//! This module defines the error hierarchy for DNS operations: message
//! parsing, network I/O, upstream forwarding and policy dispatch.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: Socket I/O and connection issues
//! - **Upstream errors**: A single upstream endpoint failed or timed out
//! - **Unavailable**: Every endpoint of a policy group failed
//! - **Config errors**: Invalid upstream or listener parameters
//!
//! # Example
//!
//! ```
//! use doh_autoproxy::dns::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(5));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error types for DNS operations
///
/// # Recoverability
///
/// - **Recoverable**: transient issues that may succeed against the next
///   upstream endpoint or on retry (timeouts, network errors, upstream errors)
/// - **Non-recoverable**: malformed input or configuration problems
#[derive(Debug, Error)]
pub enum DnsError {
    /// DNS message parsing failed
    #[error("Failed to parse DNS message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
        /// Optional domain name involved in the parse error
        domain: Option<String>,
    },

    /// DNS message serialization failed
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Network I/O error
    #[error("Network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// Query timeout
    #[error("DNS query timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// Description of what timed out
        context: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// A single upstream endpoint failed
    ///
    /// The dispatcher treats this as "retry next upstream" within a group.
    #[error("Upstream server error ({upstream}): {reason}")]
    UpstreamError {
        /// The upstream server address
        upstream: String,
        /// Description of the upstream failure
        reason: String,
        /// The DNS response code, if available
        rcode: Option<u8>,
    },

    /// Every endpoint of a policy group failed
    ///
    /// Front-ends answer this with SERVFAIL.
    #[error("All {attempts} upstream(s) of policy '{policy}' are unavailable")]
    UpstreamUnavailable {
        /// The policy group that was exhausted
        policy: String,
        /// Number of endpoints attempted
        attempts: usize,
    },

    /// The decided policy has no configured group
    #[error("No upstream group configured for policy '{policy}'")]
    UnknownPolicy {
        /// The policy name
        policy: String,
    },

    /// Invalid configuration
    #[error("Invalid DNS configuration: {reason}")]
    ConfigError {
        /// Description of the configuration error
        reason: String,
        /// The configuration field that is invalid, if applicable
        field: Option<String>,
    },

    /// Invalid query
    #[error("Invalid DNS query: {reason}")]
    InvalidQuery {
        /// Description of why the query is invalid
        reason: String,
        /// The query ID, if available
        query_id: Option<u16>,
    },

    /// Internal processing error
    #[error("Internal DNS error: {reason}")]
    InternalError {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    // ========================================================================
    // Constructor methods
    // ========================================================================

    /// Create a parse error
    ///
    /// # Example
    ///
    /// ```
    /// use doh_autoproxy::dns::DnsError;
    ///
    /// let err = DnsError::parse("invalid record type");
    /// assert!(err.to_string().contains("invalid record type"));
    /// ```
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
            domain: None,
        }
    }

    /// Create a parse error with domain context
    pub fn parse_domain(reason: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
            domain: Some(domain.into()),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error without an underlying I/O error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    ///
    /// # Example
    ///
    /// ```
    /// use doh_autoproxy::dns::DnsError;
    /// use std::time::Duration;
    ///
    /// let err = DnsError::timeout("query to 1.1.1.1:53", Duration::from_secs(2));
    /// assert!(err.is_timeout());
    /// ```
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
            rcode: None,
        }
    }

    /// Create an upstream error carrying the response code
    pub fn upstream_rcode(upstream: impl Into<String>, reason: impl Into<String>, rcode: u8) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
            rcode: Some(rcode),
        }
    }

    /// Create an error for an exhausted policy group
    ///
    /// # Example
    ///
    /// ```
    /// use doh_autoproxy::dns::DnsError;
    ///
    /// let err = DnsError::unavailable("proxy", 2);
    /// assert!(err.is_unavailable());
    /// assert!(err.to_string().contains("'proxy'"));
    /// ```
    pub fn unavailable(policy: impl Into<String>, attempts: usize) -> Self {
        Self::UpstreamUnavailable {
            policy: policy.into(),
            attempts,
        }
    }

    /// Create an unknown policy error
    pub fn unknown_policy(policy: impl Into<String>) -> Self {
        Self::UnknownPolicy {
            policy: policy.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid query error
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
            query_id: None,
        }
    }

    /// Create an invalid query error with the query ID
    pub fn invalid_query_id(reason: impl Into<String>, query_id: u16) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
            query_id: Some(query_id),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    // ========================================================================
    // Classification methods
    // ========================================================================

    /// Check if this error is recoverable
    ///
    /// Within a policy group, a recoverable error from one endpoint means
    /// the next endpoint is tried.
    ///
    /// # Example
    ///
    /// ```
    /// use doh_autoproxy::dns::DnsError;
    /// use std::time::Duration;
    ///
    /// let timeout = DnsError::timeout("query", Duration::from_secs(5));
    /// assert!(timeout.is_recoverable());
    ///
    /// let config = DnsError::config("invalid address");
    /// assert!(!config.is_recoverable());
    /// ```
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { source, .. } => source.as_ref().map_or(true, |e| {
                matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::BrokenPipe
                )
            }),
            Self::TimeoutError { .. }
            | Self::UpstreamError { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::ParseError { .. } => true,
            Self::SerializeError { .. }
            | Self::UnknownPolicy { .. }
            | Self::ConfigError { .. }
            | Self::InvalidQuery { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Check if this error indicates a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Check if this error indicates an exhausted policy group
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    /// Check if this error indicates a single upstream failure
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::UpstreamError { .. })
    }

    /// Get the query ID associated with this error, if any
    #[must_use]
    pub fn query_id(&self) -> Option<u16> {
        match self {
            Self::InvalidQuery { query_id, .. } => *query_id,
            _ => None,
        }
    }

    /// Get the upstream address associated with this error, if any
    #[must_use]
    pub fn upstream_addr(&self) -> Option<&str> {
        match self {
            Self::UpstreamError { upstream, .. } => Some(upstream),
            _ => None,
        }
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::NetworkError {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for Result with [`DnsError`]
pub type DnsResult<T> = std::result::Result<T, DnsError>;
