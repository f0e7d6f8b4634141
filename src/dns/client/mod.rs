//! DNS upstream clients
//!
//! # Supported Protocols
//!
//! - **UDP** - Plain DNS over UDP (RFC 1035), TCP retry on truncation
//! - **TCP** - Plain DNS over TCP (RFC 1035)
//! - **DoT** - DNS over TLS (RFC 7858), requires the `dns-dot` feature
//! - **DoH** - DNS over HTTPS (RFC 8484), requires the `dns-doh` feature
//!
//! ```text
//!                    ┌───────────────┐
//!                    │  DnsUpstream  │ (trait)
//!                    └───────┬───────┘
//!        ┌──────────────┬────┴─────────┬──────────────┐
//!  ┌─────┴─────┐  ┌─────┴─────┐  ┌─────┴─────┐  ┌─────┴─────┐
//!  │ UdpClient │  │ TcpClient │  │ DotClient │  │ DohClient │
//!  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  └───────────┘
//!        └─ TC retry ───┤              │
//!                 deadpool pool   deadpool pool
//! ```
//!
//! # Example
//!
//! ```no_run
//! use doh_autoproxy::dns::client::build_upstream;
//! use doh_autoproxy::dns::UpstreamConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let upstream = build_upstream(&UpstreamConfig::new("tls://1.1.1.1").with_sni("cloudflare-dns.com"))?;
//! println!("{} via {}", upstream.address(), upstream.protocol());
//! # Ok(())
//! # }
//! ```

mod doh;
mod dot;
mod tcp;
mod traits;
mod udp;

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

use crate::dns::config::{UpstreamConfig, UpstreamProtocol};
use crate::dns::error::{DnsError, DnsResult};

#[cfg(feature = "dns-doh")]
pub use doh::{DohClient, DOH_CONTENT_TYPE};
#[cfg(feature = "dns-dot")]
pub use dot::DotClient;
pub use tcp::TcpClient;
pub use traits::{validate_response, DnsUpstream, MAX_TCP_MESSAGE_SIZE, MAX_UDP_MESSAGE_SIZE};
pub use udp::UdpClient;

/// Build the client for one configured upstream
///
/// # Errors
///
/// `DnsError::ConfigError` for an unparseable address, an unresolvable
/// host, or a protocol whose feature is compiled out.
pub fn build_upstream(config: &UpstreamConfig) -> DnsResult<Arc<dyn DnsUpstream>> {
    let endpoint = config.endpoint()?;
    let timeout = config.timeout();

    let upstream: Arc<dyn DnsUpstream> = match endpoint.protocol {
        UpstreamProtocol::Udp => Arc::new(UdpClient::new(&endpoint, timeout)?),
        UpstreamProtocol::Tcp => Arc::new(TcpClient::new(&endpoint, timeout)?),
        #[cfg(feature = "dns-dot")]
        UpstreamProtocol::Dot => Arc::new(DotClient::new(&endpoint, timeout)?),
        #[cfg(feature = "dns-doh")]
        UpstreamProtocol::Doh => Arc::new(DohClient::new(&endpoint, timeout)?),
        #[allow(unreachable_patterns)]
        other => {
            return Err(DnsError::config_field(
                format!("upstream protocol '{other}' is not compiled in"),
                "upstream.protocol",
            ))
        }
    };
    Ok(upstream)
}

/// Client TLS configuration trusting the webpki roots, on the ring provider
pub(crate) fn webpki_client_config() -> DnsResult<ClientConfig> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| DnsError::config(format!("failed to build TLS client config: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}
