//! TCP DNS client
//!
//! Length-prefixed queries over pooled TCP connections (deadpool). Also
//! used by [`UdpClient`](super::UdpClient) to retry truncated answers.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{self, Manager, Object, Pool, RecycleError, RecycleResult};
use hickory_proto::op::Message;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::traits::{validate_response, DnsUpstream, MAX_TCP_MESSAGE_SIZE};
use crate::dns::config::{Endpoint, UpstreamProtocol};
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::framing::{read_frame, write_frame};

const DEFAULT_POOL_SIZE: usize = 4;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

struct TcpConnectionManager {
    server_addr: SocketAddr,
    connect_timeout: Duration,
}

#[async_trait]
impl Manager for TcpConnectionManager {
    type Type = TcpStream;
    type Error = DnsError;

    async fn create(&self) -> Result<TcpStream, DnsError> {
        match timeout(self.connect_timeout, TcpStream::connect(self.server_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(e)) => Err(DnsError::network_io(
                format!("failed to connect to TCP DNS server {}", self.server_addr),
                e,
            )),
            Err(_) => Err(DnsError::timeout(
                format!("TCP connection to {}", self.server_addr),
                self.connect_timeout,
            )),
        }
    }

    async fn recycle(&self, conn: &mut TcpStream, _metrics: &managed::Metrics) -> RecycleResult<DnsError> {
        let mut buf = [0u8; 1];
        match conn.try_read(&mut buf) {
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Ok(0) => Err(RecycleError::Message("TCP connection closed by server".to_string())),
            Ok(_) => Err(RecycleError::Message("unexpected data on idle TCP connection".to_string())),
            Err(e) => Err(RecycleError::Message(format!("TCP connection check failed: {e}"))),
        }
    }
}

/// Pooled TCP DNS client
pub struct TcpClient {
    address: String,
    server_addr: SocketAddr,
    query_timeout: Duration,
    pool: Pool<TcpConnectionManager>,
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("server_addr", &self.server_addr)
            .field("query_timeout", &self.query_timeout)
            .field("pool_size", &self.pool.status().size)
            .finish()
    }
}

impl TcpClient {
    /// Create a client for a parsed endpoint
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` if the host does not resolve or the pool
    /// cannot be built.
    pub fn new(endpoint: &Endpoint, query_timeout: Duration) -> DnsResult<Self> {
        Self::with_addr(endpoint.socket_addr()?, query_timeout)
    }

    /// Create a client for a socket address
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` if the pool cannot be built.
    pub fn with_addr(server_addr: SocketAddr, query_timeout: Duration) -> DnsResult<Self> {
        let manager = TcpConnectionManager {
            server_addr,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS).min(query_timeout),
        };
        let pool = Pool::builder(manager)
            .max_size(DEFAULT_POOL_SIZE)
            .build()
            .map_err(|e| DnsError::config(format!("failed to create TCP connection pool: {e}")))?;

        Ok(Self {
            address: format!("tcp://{server_addr}"),
            server_addr,
            query_timeout,
            pool,
        })
    }

    /// Server socket address
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    async fn query_with_connection(&self, conn: &mut TcpStream, query: &Message) -> DnsResult<Message> {
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::serialize(format!("failed to serialize DNS query: {e}")))?;
        if query_bytes.len() > MAX_TCP_MESSAGE_SIZE {
            return Err(DnsError::serialize(format!(
                "TCP query too large: {} bytes (max {MAX_TCP_MESSAGE_SIZE})",
                query_bytes.len()
            )));
        }

        let exchange = async {
            write_frame(conn, &query_bytes).await?;
            read_frame(conn).await
        };
        let frame = timeout(self.query_timeout, exchange)
            .await
            .map_err(|_| DnsError::timeout(format!("TCP query to {}", self.server_addr), self.query_timeout))?
            .map_err(|e| DnsError::network_io(format!("TCP exchange with {} failed", self.server_addr), e))?
            .ok_or_else(|| DnsError::network(format!("{} closed the connection", self.server_addr)))?;

        let response = Message::from_vec(&frame)
            .map_err(|e| DnsError::parse(format!("failed to parse TCP DNS response: {e}")))?;
        if !validate_response(query, &response) {
            return Err(DnsError::upstream(
                &self.address,
                "response validation failed (ID or QNAME mismatch)",
            ));
        }
        Ok(response)
    }

    async fn checkout(&self) -> DnsResult<Object<TcpConnectionManager>> {
        self.pool.get().await.map_err(|e| match e {
            managed::PoolError::Backend(inner) => inner,
            other => DnsError::upstream(&self.address, format!("failed to get TCP connection: {other}")),
        })
    }
}

#[async_trait]
impl DnsUpstream for TcpClient {
    async fn query(&self, query: &Message) -> DnsResult<Message> {
        let mut conn = self.checkout().await?;
        match self.query_with_connection(&mut conn, query).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_recoverable() && !e.is_timeout() => {
                // Pooled connection may have gone stale; retry once on a fresh one.
                let _ = Object::take(conn);
                debug!(upstream = %self.address, error = %e, "retrying TCP query with fresh connection");
                let mut fresh = self.checkout().await?;
                let result = self.query_with_connection(&mut fresh, query).await;
                if result.is_err() {
                    let _ = Object::take(fresh);
                }
                result
            }
            Err(e) => {
                let _ = Object::take(conn);
                Err(e)
            }
        }
    }

    fn protocol(&self) -> UpstreamProtocol {
        UpstreamProtocol::Tcp
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn timeout(&self) -> Duration {
        self.query_timeout
    }
}
