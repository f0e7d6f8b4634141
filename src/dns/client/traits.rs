//! DNS upstream client trait
//!
//! Every transport implements [`DnsUpstream`]; the dispatcher only sees
//! `Arc<dyn DnsUpstream>`.
//!
//! # Example
//!
//! ```no_run
//! use doh_autoproxy::dns::client::DnsUpstream;
//! use hickory_proto::op::Message;
//!
//! async fn ask(upstream: &dyn DnsUpstream, query: &Message) {
//!     match upstream.query(query).await {
//!         Ok(response) => println!("{} answered {:?}", upstream.address(), response.response_code()),
//!         Err(e) => println!("{} failed: {e}", upstream.address()),
//!     }
//! }
//! ```

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::dns::config::{UpstreamProtocol, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use crate::dns::error::DnsResult;

/// Maximum DNS message size for UDP without EDNS
pub const MAX_UDP_MESSAGE_SIZE: usize = 512;

/// Maximum DNS message size for length-prefixed transports
pub const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// A single upstream resolver
#[async_trait]
pub trait DnsUpstream: Send + Sync + Debug {
    /// Send a query and await the matching response
    ///
    /// # Errors
    ///
    /// Returns `DnsError` on connection failure, timeout, an undecodable
    /// response, or a response whose ID/question does not match the query.
    async fn query(&self, query: &Message) -> DnsResult<Message>;

    /// Transport used by this upstream
    fn protocol(&self) -> UpstreamProtocol;

    /// Address for logging (`udp://8.8.8.8:53`, a DoH URL, ...)
    fn address(&self) -> &str;

    /// Bound on a single query
    fn timeout(&self) -> Duration {
        Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS)
    }

    /// Whether the transport is encrypted
    fn is_encrypted(&self) -> bool {
        matches!(self.protocol(), UpstreamProtocol::Doh | UpstreamProtocol::Dot)
    }
}

/// Check that a response answers `query` (same ID and question)
#[must_use]
pub fn validate_response(query: &Message, response: &Message) -> bool {
    if query.id() != response.id() {
        return false;
    }
    match (query.queries().first(), response.queries().first()) {
        (Some(q), Some(r)) => {
            q.name() == r.name() && q.query_type() == r.query_type() && q.query_class() == r.query_class()
        }
        _ => false,
    }
}
