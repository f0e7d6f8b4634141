//! HTTP-01 challenge responder
//!
//! Serves `/.well-known/acme-challenge/<token>` from a shared in-memory
//! store and redirects every other request to the HTTPS origin with a 301.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::error::{CertError, CertResult};
use crate::dns::server::shutdown_requested;

/// Path prefix for HTTP-01 tokens (RFC 8555 §8.3)
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 tokens and their key authorizations
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens.insert(token.into(), key_authorization.into());
    }

    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Plain HTTP listener answering challenges and redirecting to HTTPS
#[derive(Debug)]
pub struct ChallengeServer {
    listener: TcpListener,
    store: ChallengeStore,
    local_addr: SocketAddr,
}

impl ChallengeServer {
    /// # Errors
    ///
    /// `CertError::Challenge` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, store: ChallengeStore) -> CertResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CertError::Challenge(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CertError::Challenge(format!("failed to get local address: {e}")))?;
        Ok(Self {
            listener,
            store,
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.local_addr, "HTTP-01 responder listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    info!(addr = %self.local_addr, "HTTP-01 responder stopping");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "HTTP-01 accept error");
                        continue;
                    }
                },
            };

            let store = self.store.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let store = store.clone();
                    async move { Ok::<_, Infallible>(respond(&store, &req)) }
                });
                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    trace!(peer = %peer, error = %e, "HTTP-01 connection ended with error");
                }
            });
        }
    }
}

/// Answer one request
pub(crate) fn respond<B>(store: &ChallengeStore, req: &Request<B>) -> Response<Full<Bytes>> {
    if let Some(token) = req.uri().path().strip_prefix(CHALLENGE_PATH_PREFIX) {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }
        return match store.get(token) {
            Some(key_auth) => {
                debug!(token, "Serving HTTP-01 challenge");
                let mut resp = Response::new(Full::new(Bytes::from(key_auth)));
                resp.headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                resp
            }
            None => {
                warn!(token, "Unknown HTTP-01 token requested");
                status(StatusCode::NOT_FOUND)
            }
        };
    }

    let Some(host) = request_host(req) else {
        return status(StatusCode::BAD_REQUEST);
    };
    let mut target = format!("https://{host}{}", req.uri().path());
    if let Some(query) = req.uri().query().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    match HeaderValue::from_str(&target) {
        Ok(location) => {
            let mut resp = status(StatusCode::MOVED_PERMANENTLY);
            resp.headers_mut().insert(header::LOCATION, location);
            resp
        }
        Err(_) => status(StatusCode::BAD_REQUEST),
    }
}

/// Host without the plain-HTTP port
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?
        .trim();
    if host.is_empty() {
        return None;
    }
    let bare = match host.rsplit_once(':') {
        // `[v6]:port` or `name:port`; a bare IPv6 literal has no brackets here
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) && (!name.contains(':') || name.ends_with(']')) => {
            name
        }
        _ => host,
    };
    Some(bare.to_string())
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = code;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn get(uri: &str, host: &str) -> Request<()> {
        Request::get(uri).header(header::HOST, host).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_known_token() {
        let store = ChallengeStore::new();
        store.insert("tok123", "tok123.thumbprint");

        let resp = respond(&store, &get("/.well-known/acme-challenge/tok123", "dns.example.com"));
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tok123.thumbprint");

        store.remove("tok123");
        assert!(store.is_empty());
        let resp = respond(&store, &get("/.well-known/acme-challenge/tok123", "dns.example.com"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_redirects_to_https() {
        let store = ChallengeStore::new();

        let resp = respond(&store, &get("/dns-query?dns=AAAB", "dns.example.com"));
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()[header::LOCATION], "https://dns.example.com/dns-query?dns=AAAB");

        let resp = respond(&store, &get("/", "dns.example.com:80"));
        assert_eq!(resp.headers()[header::LOCATION], "https://dns.example.com/");

        let resp = respond(&store, &get("/a", "[2001:db8::1]:80"));
        assert_eq!(resp.headers()[header::LOCATION], "https://[2001:db8::1]/a");
    }

    #[test]
    fn test_missing_host_is_bad_request() {
        let store = ChallengeStore::new();
        let req = Request::get("/").body(()).unwrap();
        assert_eq!(respond(&store, &req).status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_server_answers_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let store = ChallengeStore::new();
        store.insert("live", "live.key");
        let server = ChallengeServer::bind("127.0.0.1:0".parse().unwrap(), store).await.unwrap();
        let addr = server.local_addr();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /.well-known/acme-challenge/live HTTP/1.1\r\nHost: dns.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("live.key"));
    }
}
