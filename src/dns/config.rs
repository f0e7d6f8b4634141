//! Upstream endpoint configuration
//!
//! Each upstream group in the configuration is an ordered list of
//! [`UpstreamConfig`]. The protocol is taken from the address scheme unless
//! set explicitly:
//!
//! | address                         | protocol |
//! |---------------------------------|----------|
//! | `8.8.8.8:53`, `udp://8.8.8.8`   | UDP      |
//! | `tcp://8.8.8.8:53`              | TCP      |
//! | `tls://dns.google`              | DoT      |
//! | `https://dns.google/dns-query`  | DoH      |
//!
//! # Example
//!
//! ```
//! use doh_autoproxy::dns::{UpstreamConfig, UpstreamProtocol};
//!
//! let upstream = UpstreamConfig::new("tls://1.1.1.1").with_sni("one.one.one.one");
//! let endpoint = upstream.endpoint().unwrap();
//! assert_eq!(endpoint.protocol, UpstreamProtocol::Dot);
//! assert_eq!(endpoint.port, 853);
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DnsError, DnsResult};

/// Default per-upstream query timeout
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;

const DEFAULT_DNS_PORT: u16 = 53;
const DEFAULT_DOT_PORT: u16 = 853;

/// Upstream transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    /// Plain UDP (RFC 1035), retried over TCP when truncated
    #[default]
    Udp,
    /// Plain TCP (RFC 1035)
    Tcp,
    /// DNS-over-TLS (RFC 7858)
    Dot,
    /// DNS-over-HTTPS (RFC 8484)
    Doh,
}

impl UpstreamProtocol {
    const fn scheme(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Dot => "tls",
            Self::Doh => "https",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            "tls" | "dot" => Some(Self::Dot),
            "https" | "doh" => Some(Self::Doh),
            _ => None,
        }
    }
}

impl fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
            Self::Dot => write!(f, "dot"),
            Self::Doh => write!(f, "doh"),
        }
    }
}

/// One upstream server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Server address, optionally with a scheme
    pub address: String,

    /// Explicit protocol (otherwise taken from the scheme, then UDP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<UpstreamProtocol>,

    /// Query timeout in seconds; unset means the server-wide default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// TLS server name when the DoT address is an IP literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

impl UpstreamConfig {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocol: None,
            timeout_secs: None,
            sni: None,
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: UpstreamProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Fill in the timeout when the entry does not set one
    #[must_use]
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs.get_or_insert(secs);
        self
    }

    #[must_use]
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Query timeout (at least one second)
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS).max(1))
    }

    /// Resolve protocol, host and port from the address
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` for an unknown scheme, a scheme that
    /// contradicts `protocol`, or a malformed host/port.
    pub fn endpoint(&self) -> DnsResult<Endpoint> {
        let address = self.address.trim();
        let (scheme, rest) = match address.split_once("://") {
            Some((scheme, rest)) => {
                let protocol = UpstreamProtocol::from_scheme(scheme).ok_or_else(|| {
                    DnsError::config_field(format!("unknown scheme '{scheme}' in '{address}'"), "upstream.address")
                })?;
                (Some(protocol), rest)
            }
            None => (None, address),
        };

        let protocol = match (scheme, self.protocol) {
            (Some(s), Some(p)) if s != p => {
                return Err(DnsError::config_field(
                    format!("address '{address}' uses scheme '{}' but protocol is '{p}'", s.scheme()),
                    "upstream.protocol",
                ))
            }
            (Some(p), _) | (None, Some(p)) => p,
            (None, None) => UpstreamProtocol::Udp,
        };

        if protocol == UpstreamProtocol::Doh {
            let url = if scheme.is_some() {
                address.to_string()
            } else {
                format!("https://{address}")
            };
            let uri: http::Uri = url
                .parse()
                .map_err(|e| DnsError::config_field(format!("invalid DoH URL '{url}': {e}"), "upstream.address"))?;
            let host = uri
                .host()
                .ok_or_else(|| DnsError::config_field(format!("DoH URL '{url}' has no host"), "upstream.address"))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let port = uri.port_u16().unwrap_or(443);
            return Ok(Endpoint {
                protocol,
                host,
                port,
                url: Some(url),
                sni: self.sni.clone(),
            });
        }

        let default_port = if protocol == UpstreamProtocol::Dot {
            DEFAULT_DOT_PORT
        } else {
            DEFAULT_DNS_PORT
        };
        let (host, port) = split_host_port(rest.trim_end_matches('/'), default_port)
            .ok_or_else(|| DnsError::config_field(format!("invalid upstream address '{address}'"), "upstream.address"))?;

        Ok(Endpoint {
            protocol,
            host,
            port,
            url: None,
            sni: self.sni.clone(),
        })
    }
}

/// Parsed upstream address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: UpstreamProtocol,
    /// Host name or IP literal (no brackets)
    pub host: String,
    pub port: u16,
    /// Full URL for DoH
    pub url: Option<String>,
    /// TLS server name override
    pub sni: Option<String>,
}

impl Endpoint {
    /// TLS server name: explicit SNI, else the host
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.host)
    }

    /// Socket address of the server
    ///
    /// Host names are resolved once with the system resolver; this runs at
    /// startup when the upstream table is built.
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` when the name does not resolve.
    pub fn socket_addr(&self) -> DnsResult<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| DnsError::config_field(format!("failed to resolve '{}': {e}", self.host), "upstream.address"))?
            .next()
            .ok_or_else(|| DnsError::config_field(format!("no addresses found for '{}'", self.host), "upstream.address"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(url) = &self.url {
            return write!(f, "{url}");
        }
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port)
        }
    }
}

/// Split `host[:port]`, `[v6][:port]` or a bare IPv6 literal
fn split_host_port(s: &str, default_port: u16) -> Option<(String, u16)> {
    if s.is_empty() {
        return None;
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some((ip.to_string(), default_port));
    }
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        host.parse::<IpAddr>().ok()?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((s.to_string(), default_port)),
    }
}
