//! DNS over HTTPS (RFC 8484)
//!
//! HTTP/1.1 and HTTP/2 over TLS (ALPN `h2`, `http/1.1`) on one path:
//!
//! - `GET <path>?dns=<base64url, no padding>`
//! - `POST <path>` with `Content-Type: application/dns-message`
//!
//! Answers carry `Cache-Control: max-age=<smallest answer TTL>`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hickory_proto::op::Message;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::server::ResolvesServerCert;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace};

use super::handler::{DnsHandler, QueryContext, Transport};
use super::tcp::is_fatal_accept_error;
use super::{shutdown_requested, tls_server_config, ConnectionTracker, ServerOptions};
use crate::dns::client::MAX_TCP_MESSAGE_SIZE;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::response::min_answer_ttl;

/// Default request path
pub const DEFAULT_DOH_PATH: &str = "/dns-query";

const DNS_MESSAGE: &str = "application/dns-message";

/// DoH listener
pub struct DohServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<DnsHandler>,
    path: Arc<str>,
    options: ServerOptions,
    tracker: Arc<ConnectionTracker>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for DohServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohServer")
            .field("local_addr", &self.local_addr)
            .field("path", &self.path)
            .field("active", &self.tracker.active())
            .finish()
    }
}

impl DohServer {
    /// Bind the listener; an empty `path` means [`DEFAULT_DOH_PATH`]
    ///
    /// # Errors
    ///
    /// `DnsError::NetworkError` if the address cannot be bound,
    /// `DnsError::ConfigError` if the TLS configuration is rejected.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<DnsHandler>,
        resolver: Arc<dyn ResolvesServerCert>,
        path: &str,
        options: ServerOptions,
    ) -> DnsResult<Self> {
        let config = tls_server_config(resolver, &[b"h2", b"http/1.1"])?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind DoH listener to {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handler,
            path: Arc::from(normalize_path(path)),
            tracker: ConnectionTracker::new(options.max_connections),
            options,
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
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
        info!(addr = %self.local_addr, path = %self.path, "DoH server listening");

        loop {
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    info!(addr = %self.local_addr, "DoH server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, shutdown.clone()),
                    Err(e) if is_fatal_accept_error(&e) => {
                        error!(addr = %self.local_addr, error = %e, "fatal DoH accept error");
                        return Err(DnsError::network_io("DoH accept failed", e));
                    }
                    Err(e) => debug!(error = %e, "non-fatal DoH accept error"),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        let Some(guard) = self.tracker.try_acquire() else {
            debug!(peer = %peer, limit = self.options.max_connections, "DoH connection rejected: limit reached");
            return;
        };
        stream.set_nodelay(true).ok();

        let acceptor = self.acceptor.clone();
        let handler = Arc::clone(&self.handler);
        let path = Arc::clone(&self.path);
        let handshake_timeout = self.options.idle_timeout;

        tokio::spawn(async move {
            let _guard = guard;
            let tls = match timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "DoH handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "DoH handshake timed out");
                    return;
                }
            };

            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                let path = Arc::clone(&path);
                async move { Ok::<_, Infallible>(respond(&handler, &path, peer, req).await) }
            });
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(tls), service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        trace!(peer = %peer, error = %e, "DoH connection ended with error");
                    }
                }
                () = shutdown_requested(&mut shutdown) => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        DEFAULT_DOH_PATH.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Turn one HTTP request into an HTTP response
pub(crate) async fn respond<B>(handler: &DnsHandler, path: &str, peer: SocketAddr, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.uri().path() != path {
        return status(StatusCode::NOT_FOUND);
    }

    let query = match *req.method() {
        Method::GET => match dns_param(req.uri().query()) {
            Ok(query) => query,
            Err(code) => return status(code),
        },
        Method::POST => {
            if !is_dns_message(req.headers().get(header::CONTENT_TYPE)) {
                return status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
            }
            match Limited::new(req.into_body(), MAX_TCP_MESSAGE_SIZE).collect().await {
                Ok(body) => body.to_bytes(),
                Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                    return status(StatusCode::PAYLOAD_TOO_LARGE)
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "failed to read DoH request body");
                    return status(StatusCode::BAD_REQUEST);
                }
            }
        }
        _ => {
            let mut resp = status(StatusCode::METHOD_NOT_ALLOWED);
            resp.headers_mut().insert(header::ALLOW, HeaderValue::from_static("GET, POST"));
            return resp;
        }
    };

    let ctx = QueryContext::new(peer, Transport::Doh);
    let Some(reply) = handler.handle(&ctx, &query).await else {
        return status(StatusCode::BAD_REQUEST);
    };
    let max_age = Message::from_vec(&reply).ok().and_then(|m| min_answer_ttl(&m)).unwrap_or(0);

    let mut resp = Response::new(Full::new(Bytes::from(reply)));
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(DNS_MESSAGE));
    if let Ok(value) = HeaderValue::from_str(&format!("max-age={max_age}")) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    resp
}

/// Decode the `dns` query parameter of a GET request
fn dns_param(query: Option<&str>) -> Result<Bytes, StatusCode> {
    let encoded = query
        .unwrap_or("")
        .split('&')
        .find_map(|pair| pair.strip_prefix("dns="))
        .filter(|v| !v.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    // Base64 grows input by 4/3; reject before decoding.
    if encoded.len() > MAX_TCP_MESSAGE_SIZE / 3 * 4 + 4 {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map(Bytes::from)
        .map_err(|_| StatusCode::BAD_REQUEST)
}

fn is_dns_message(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(DNS_MESSAGE))
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = code;
    resp
}
