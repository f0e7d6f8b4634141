//! DNS over dedicated QUIC connections (RFC 9250)
//!
//! Each client-initiated bidirectional stream carries exactly one
//! length-prefixed query and one length-prefixed response. Streams are
//! independent and handled concurrently.
//!
//! On shutdown a connection stops accepting streams, lets the ones in
//! flight finish within the shutdown grace, and only then closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use rustls::server::ResolvesServerCert;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::handler::{DnsHandler, QueryContext, Transport};
use super::{shutdown_requested, tls_server_config, ConnectionTracker, ServerOptions};
use crate::dns::client::MAX_TCP_MESSAGE_SIZE;
use crate::dns::error::{DnsError, DnsResult};

/// ALPN token for DoQ
pub const DOQ_ALPN: &[u8] = b"doq";

/// Concurrent streams a single client may open
const MAX_CONCURRENT_STREAMS: u32 = 128;

/// RFC 9250 §4.3 application error codes
const DOQ_NO_ERROR: u32 = 0x0;
const DOQ_PROTOCOL_ERROR: u32 = 0x2;

/// DoQ listener
#[derive(Debug)]
pub struct DoqServer {
    endpoint: Endpoint,
    handler: Arc<DnsHandler>,
    tracker: Arc<ConnectionTracker>,
    local_addr: SocketAddr,
    grace: Duration,
}

impl DoqServer {
    /// Bind the QUIC endpoint
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` if the TLS/QUIC configuration is rejected,
    /// `DnsError::NetworkError` if the UDP socket cannot be bound.
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<DnsHandler>,
        resolver: Arc<dyn ResolvesServerCert>,
        options: &ServerOptions,
    ) -> DnsResult<Self> {
        let tls = tls_server_config(resolver, &[DOQ_ALPN])?;
        let crypto = QuicServerConfig::try_from(tls)
            .map_err(|e| DnsError::config(format!("failed to create QUIC crypto config: {e}")))?;

        let mut transport = quinn::TransportConfig::default();
        let idle = options
            .idle_timeout
            .try_into()
            .map_err(|_| DnsError::config("invalid DoQ idle timeout"))?;
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_STREAMS));
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| DnsError::network_io(format!("failed to bind DoQ endpoint to {addr}"), e))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        Ok(Self {
            endpoint,
            handler,
            tracker: ConnectionTracker::new(options.max_connections),
            local_addr,
            grace: options.shutdown_grace,
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
    /// Never fails once bound.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr, "DoQ server listening");

        loop {
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    info!(addr = %self.local_addr, "DoQ server stopping");
                    // Refuse new handshakes; live connections keep their streams.
                    self.endpoint.set_server_config(None);
                    return Ok(());
                }
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { return Ok(()) };
                    let Some(guard) = self.tracker.try_acquire() else {
                        debug!(peer = %incoming.remote_address(), "DoQ connection refused: limit reached");
                        incoming.refuse();
                        continue;
                    };
                    let handler = Arc::clone(&self.handler);
                    let shutdown = shutdown.clone();
                    let grace = self.grace;
                    tokio::spawn(async move {
                        let _guard = guard;
                        let peer = incoming.remote_address();
                        match incoming.await {
                            Ok(conn) => serve_connection(conn, handler, shutdown, grace).await,
                            Err(e) => debug!(peer = %peer, error = %e, "DoQ handshake failed"),
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(
    conn: Connection,
    handler: Arc<DnsHandler>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let peer = conn.remote_address();
    trace!(peer = %peer, "DoQ connection established");

    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            () = shutdown_requested(&mut shutdown) => break,
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
            stream = conn.accept_bi() => match stream {
                Ok((send, recv)) => {
                    let handler = Arc::clone(&handler);
                    let conn = conn.clone();
                    streams.spawn(async move {
                        if let Err(reason) = serve_stream(send, recv, peer, &handler).await {
                            debug!(peer = %peer, reason, "DoQ protocol error");
                            conn.close(VarInt::from_u32(DOQ_PROTOCOL_ERROR), reason.as_bytes());
                        }
                    });
                }
                Err(e) => {
                    trace!(peer = %peer, error = %e, "DoQ connection closed");
                    return;
                }
            },
        }
    }

    if !streams.is_empty() {
        let in_flight = streams.len();
        let drain = async { while streams.join_next().await.is_some() {} };
        if timeout(grace, drain).await.is_err() {
            debug!(peer = %peer, in_flight, "DoQ streams cut off after grace period");
            streams.abort_all();
        }
    }
    conn.close(VarInt::from_u32(DOQ_NO_ERROR), b"shutdown");
}

/// One query/response exchange; `Err` carries the reason for a protocol
/// error close
async fn serve_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    peer: SocketAddr,
    handler: &DnsHandler,
) -> Result<(), &'static str> {
    let data = recv
        .read_to_end(MAX_TCP_MESSAGE_SIZE + 2)
        .await
        .map_err(|_| "failed to read query stream")?;
    let query = unframe(&data).ok_or("malformed query framing")?;

    let ctx = QueryContext::new(peer, Transport::Doq);
    let Some(reply) = handler.handle(&ctx, query).await else {
        return Err("query too short");
    };

    let len = u16::try_from(reply.len()).map_err(|_| "response too large")?;
    let mut framed = Vec::with_capacity(reply.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&reply);

    // The peer may reset its stream early; that only ends this exchange.
    if send.write_all(&framed).await.is_ok() && send.finish().is_ok() {
        // Wait for the peer to acknowledge so a closing connection does
        // not discard the response
        let _ = send.stopped().await;
    }
    Ok(())
}

/// Strip the 2-byte prefix, requiring it to cover the whole stream
fn unframe(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 2 {
        return None;
    }
    let (prefix, body) = data.split_at(2);
    let len = usize::from(u16::from_be_bytes([prefix[0], prefix[1]]));
    (len == body.len() && !body.is_empty()).then_some(body)
}
