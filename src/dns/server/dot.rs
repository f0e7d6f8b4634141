//! DNS over TLS (RFC 7858)
//!
//! TCP framing inside a TLS session. The certificate is picked per
//! handshake by the resolver, so a renewed certificate applies to new
//! connections without restarting the listener.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::server::ResolvesServerCert;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use super::handler::{DnsHandler, QueryContext, Transport};
use super::tcp::{is_fatal_accept_error, serve_framed};
use super::{shutdown_requested, tls_server_config, ConnectionTracker, ServerOptions};
use crate::dns::error::{DnsError, DnsResult};

/// DoT listener
pub struct DotServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<DnsHandler>,
    options: ServerOptions,
    tracker: Arc<ConnectionTracker>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for DotServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotServer")
            .field("local_addr", &self.local_addr)
            .field("options", &self.options)
            .field("active", &self.tracker.active())
            .finish()
    }
}

impl DotServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// `DnsError::NetworkError` if the address cannot be bound,
    /// `DnsError::ConfigError` if the TLS configuration is rejected.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<DnsHandler>,
        resolver: Arc<dyn ResolvesServerCert>,
        options: ServerOptions,
    ) -> DnsResult<Self> {
        let config = tls_server_config(resolver, &[b"dot"])?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind DoT listener to {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            tracker: ConnectionTracker::new(options.max_connections),
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
    /// A fatal accept error.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr, "DoT server listening");

        loop {
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    info!(addr = %self.local_addr, "DoT server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, shutdown.clone()),
                    Err(e) if is_fatal_accept_error(&e) => {
                        error!(addr = %self.local_addr, error = %e, "fatal DoT accept error");
                        return Err(DnsError::network_io("DoT accept failed", e));
                    }
                    Err(e) => debug!(error = %e, "non-fatal DoT accept error"),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        let Some(guard) = self.tracker.try_acquire() else {
            debug!(peer = %peer, limit = self.options.max_connections, "DoT connection rejected: limit reached");
            return;
        };
        stream.set_nodelay(true).ok();

        let acceptor = self.acceptor.clone();
        let handler = Arc::clone(&self.handler);
        let idle = self.options.idle_timeout;
        tokio::spawn(async move {
            let _guard = guard;
            let tls = match timeout(idle, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "DoT handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "DoT handshake timed out");
                    return;
                }
            };
            let ctx = QueryContext::new(peer, Transport::Dot);
            if let Err(e) = serve_framed(tls, ctx, handler, idle, shutdown).await {
                debug!(peer = %peer, error = %e, "DoT connection error");
            }
        });
    }
}
