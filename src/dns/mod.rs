//! DNS forwarding engine
//!
//! Queries arrive on one of five front-ends and all go through the same
//! [`server::DnsHandler`]:
//!
//! ```text
//!  UDP ─┐
//!  TCP ─┤
//!  DoT ─┼─▶ DnsHandler ──▶ Router (pre pass) ──▶ Dispatcher ──▶ upstream group
//!  DoQ ─┤        │                                     ▲
//!  DoH ─┘        └──▶ Router (post pass, answer IPs) ──┘ re-forward if the
//!                                                        policy changes
//! ```
//!
//! - [`client`]: upstream clients (UDP, TCP, and with features DoT / DoH)
//! - [`dispatch`]: upstream groups tried in order
//! - [`server`]: listeners and the shared handler
//! - [`response`]: locally synthesised answers (NXDOMAIN, SERVFAIL, forced addresses)
//!
//! There is no cache: every query that is not answered locally goes to an
//! upstream.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod response;
pub mod server;

pub use config::{Endpoint, UpstreamConfig, UpstreamProtocol, DEFAULT_UPSTREAM_TIMEOUT_SECS};
pub use dispatch::Dispatcher;
pub use error::{DnsError, DnsResult};

pub use client::{build_upstream, DnsUpstream, TcpClient, UdpClient};

#[cfg(feature = "dns-doh")]
pub use client::DohClient;

#[cfg(feature = "dns-dot")]
pub use client::DotClient;

pub use server::{
    DnsHandler, DohServer, DoqServer, DotServer, QueryContext, ServerOptions, TcpDnsServer, Transport, UdpDnsServer,
};
