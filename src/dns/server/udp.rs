//! Plain DNS over UDP
//!
//! One datagram in, one datagram out. Each query runs in its own task so
//! a slow upstream never stalls the receive loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::handler::{DnsHandler, QueryContext, Transport};
use super::{shutdown_requested, ConnectionTracker};
use crate::dns::error::{DnsError, DnsResult};

/// Receive buffer; queries larger than this are not legitimate
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Kernel receive queue requested for the listening socket (best effort)
const SO_RCVBUF_SIZE: usize = 1 << 20;

/// Datagram counters
#[derive(Debug, Default)]
pub struct UdpServerStats {
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

/// UDP DNS listener
#[derive(Debug)]
pub struct UdpDnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    tracker: Arc<ConnectionTracker>,
    stats: Arc<UdpServerStats>,
    local_addr: SocketAddr,
}

impl UdpDnsServer {
    /// Bind the socket
    ///
    /// # Errors
    ///
    /// `DnsError::NetworkError` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, handler: Arc<DnsHandler>) -> DnsResult<Self> {
        let socket = create_socket(addr)
            .map_err(|e| DnsError::network_io(format!("failed to bind UDP socket to {addr}"), e))?;
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| DnsError::network_io("failed to register UDP socket", e))?;
        Self::from_socket(socket, handler)
    }

    /// Wrap an already bound socket
    ///
    /// # Errors
    ///
    /// `DnsError::NetworkError` if the local address cannot be read.
    pub fn from_socket(socket: UdpSocket, handler: Arc<DnsHandler>) -> DnsResult<Self> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;
        Ok(Self {
            socket: Arc::new(socket),
            handler,
            tracker: ConnectionTracker::unbounded(),
            stats: Arc::new(UdpServerStats::default()),
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// In-flight queries
    #[must_use]
    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<UdpServerStats> {
        Arc::clone(&self.stats)
    }

    /// Receive and answer datagrams until shutdown
    ///
    /// # Errors
    ///
    /// Never fails once bound; receive errors are logged and skipped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr, "UDP DNS server listening");
        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    info!(addr = %self.local_addr, "UDP DNS server stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                        trace!(peer = %peer, len, "received UDP query");
                        self.spawn_query(buf[..len].to_vec(), peer);
                    }
                    // ICMP port-unreachable from an earlier reply surfaces here on some platforms.
                    Err(e) => debug!(error = %e, "UDP receive error"),
                },
            }
        }
    }

    fn spawn_query(&self, query: Vec<u8>, peer: SocketAddr) {
        let Some(guard) = self.tracker.try_acquire() else { return };
        let socket = Arc::clone(&self.socket);
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let _guard = guard;
            let ctx = QueryContext::new(peer, Transport::Udp);
            let Some(reply) = handler.handle(&ctx, &query).await else { return };
            match socket.send_to(&reply, peer).await {
                Ok(_) => {
                    stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %peer, error = %e, "failed to send UDP response");
                }
            }
        });
    }
}

/// Non-blocking UDP socket bound to `addr`
///
/// A wildcard IPv6 address also accepts IPv4 where the OS allows it.
fn create_socket(addr: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        if let Err(e) = socket.set_only_v6(false) {
            debug!(error = %e, "Dual-stack UDP socket not available");
        }
    }
    if let Err(e) = socket.set_recv_buffer_size(SO_RCVBUF_SIZE) {
        debug!(error = %e, "Failed to raise UDP receive buffer");
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
