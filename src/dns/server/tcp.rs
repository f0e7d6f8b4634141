//! Plain DNS over TCP
//!
//! Length-prefixed messages (RFC 1035 §4.2.2, RFC 7766). Queries on one
//! connection are answered in the order they were sent; the connection
//! is closed after the idle timeout or when shutdown is requested.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use super::handler::{DnsHandler, QueryContext, Transport};
use super::{shutdown_requested, ConnectionTracker, ServerOptions};
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::framing::{read_frame, write_frame};

/// TCP DNS listener
#[derive(Debug)]
pub struct TcpDnsServer {
    listener: TcpListener,
    handler: Arc<DnsHandler>,
    options: ServerOptions,
    tracker: Arc<ConnectionTracker>,
    local_addr: SocketAddr,
}

impl TcpDnsServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// `DnsError::NetworkError` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, handler: Arc<DnsHandler>, options: ServerOptions) -> DnsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind TCP listener to {addr}"), e))?;
        Self::from_listener(listener, handler, options)
    }

    /// Wrap an already bound listener
    ///
    /// # Errors
    ///
    /// `DnsError::NetworkError` if the local address cannot be read.
    pub fn from_listener(listener: TcpListener, handler: Arc<DnsHandler>, options: ServerOptions) -> DnsResult<Self> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;
        Ok(Self {
            tracker: ConnectionTracker::new(options.max_connections),
            listener,
            handler,
            options,
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept connections until shutdown
    ///
    /// # Errors
    ///
    /// A fatal accept error (descriptor exhaustion is retried).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr, "TCP DNS server listening");

        loop {
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    info!(addr = %self.local_addr, "TCP DNS server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, shutdown.clone()),
                    Err(e) if is_fatal_accept_error(&e) => {
                        error!(addr = %self.local_addr, error = %e, "fatal TCP accept error");
                        return Err(DnsError::network_io("TCP accept failed", e));
                    }
                    Err(e) => debug!(error = %e, "non-fatal TCP accept error"),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        let Some(guard) = self.tracker.try_acquire() else {
            debug!(peer = %peer, limit = self.options.max_connections, "TCP connection rejected: limit reached");
            return;
        };
        stream.set_nodelay(true).ok();

        let handler = Arc::clone(&self.handler);
        let idle = self.options.idle_timeout;
        tokio::spawn(async move {
            let _guard = guard;
            let ctx = QueryContext::new(peer, Transport::Tcp);
            if let Err(e) = serve_framed(stream, ctx, handler, idle, shutdown).await {
                debug!(peer = %peer, error = %e, "TCP connection error");
            }
        });
    }
}

/// Answer length-prefixed queries on one stream until EOF, idle timeout
/// or shutdown
///
/// Shared by TCP and DoT.
pub(crate) async fn serve_framed<S>(
    mut stream: S,
    ctx: QueryContext,
    handler: Arc<DnsHandler>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = shutdown_requested(&mut shutdown) => return Ok(()),
            read = timeout(idle_timeout, read_frame(&mut stream)) => match read {
                Err(_) => {
                    trace!(peer = %ctx.client, transport = %ctx.transport, "connection idle timeout");
                    return Ok(());
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(frame))) => frame,
                Ok(Err(e)) => return Err(e),
            },
        };

        if let Some(reply) = handler.handle(&ctx, &frame).await {
            write_frame(&mut stream, &reply).await?;
        }
    }
}

/// Errors after which the accept loop cannot make progress
pub(crate) fn is_fatal_accept_error(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse | io::ErrorKind::InvalidInput)
}
