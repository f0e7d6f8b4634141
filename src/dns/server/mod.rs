//! DNS front-ends
//!
//! Five listeners share one [`DnsHandler`]:
//!
//! | Listener         | Framing                                   |
//! |------------------|-------------------------------------------|
//! | [`UdpDnsServer`] | one datagram per message, TC truncation    |
//! | [`TcpDnsServer`] | 2-byte length prefix, pipelined            |
//! | [`DotServer`]    | TCP framing inside TLS                     |
//! | [`DoqServer`]    | one length-prefixed message per QUIC stream |
//! | [`DohServer`]    | HTTP GET/POST `application/dns-message`    |
//!
//! Every server runs until the shutdown watch channel flips to `true`.
//! Accept loops stop at once; in-flight connections are tracked by a
//! [`ConnectionTracker`] so the caller can give them a grace period.

mod doh;
mod doq;
mod dot;
mod handler;
mod tcp;
mod udp;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use tokio::sync::{watch, Notify};

use crate::dns::error::{DnsError, DnsResult};

pub use doh::{DohServer, DEFAULT_DOH_PATH};
pub use doq::{DoqServer, DOQ_ALPN};
pub use dot::DotServer;
pub use handler::{
    client_udp_limit, truncate_for_udp, validate_query, DnsHandler, HandlerStats, HandlerStatsSnapshot,
    QueryContext, Resolved, Transport, MAX_EDNS_UDP_SIZE,
};
pub use tcp::TcpDnsServer;
pub use udp::UdpDnsServer;

/// Default idle timeout for TCP and DoT connections
pub const DEFAULT_TCP_IDLE_TIMEOUT_SECS: u64 = 10;

/// Default cap on concurrent TCP/DoT/DoH connections per listener
pub const DEFAULT_MAX_TCP_CONNECTIONS: usize = 1024;

/// Default time in-flight queries get to finish after shutdown
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Listener tuning shared by the connection-oriented front-ends
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub idle_timeout: Duration,
    pub max_connections: usize,
    /// Bound on draining in-flight streams once shutdown is signalled
    pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_TCP_IDLE_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_TCP_CONNECTIONS,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Resolves once shutdown is requested (or the sender is gone)
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Counts live connections against a cap
#[derive(Debug)]
pub struct ConnectionTracker {
    max: usize,
    active: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    idle: Notify,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            active: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            idle: Notify::new(),
        })
    }

    /// Tracker without a cap (UDP in-flight queries, QUIC connections)
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    /// Reserve a slot; `None` when the cap is reached
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max).then_some(n + 1))
            .is_ok();
        if reserved {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            Some(ConnectionGuard {
                tracker: Arc::clone(self),
            })
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Wait until no connection is live, at most `grace`
    ///
    /// Returns `false` if connections were still open when the grace
    /// period ran out.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Slot held for the life of a connection
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

/// Server TLS configuration resolving certificates per handshake
///
/// # Errors
///
/// `DnsError::ConfigError` if the ring provider rejects the protocol set.
pub fn tls_server_config(resolver: Arc<dyn ResolvesServerCert>, alpn: &[&[u8]]) -> DnsResult<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| DnsError::config(format!("failed to build TLS server config: {e}")))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}
