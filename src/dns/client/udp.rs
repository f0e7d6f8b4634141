//! UDP DNS client
//!
//! Stateless queries over a fresh ephemeral socket. Answers with the TC bit
//! set are retried over TCP to the same server.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::tcp::TcpClient;
use super::traits::{validate_response, DnsUpstream};
use crate::dns::config::{Endpoint, UpstreamProtocol};
use crate::dns::error::{DnsError, DnsResult};

/// Receive buffer; large enough for any EDNS payload we advertise
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Attempts per query (first try plus retries)
const UDP_ATTEMPTS: u32 = 2;

/// UDP DNS client with TCP fallback for truncated answers
#[derive(Debug)]
pub struct UdpClient {
    address: String,
    server_addr: SocketAddr,
    timeout: Duration,
    tcp_fallback: TcpClient,
}

impl UdpClient {
    /// Create a client for a parsed endpoint
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` if the host does not resolve.
    pub fn new(endpoint: &Endpoint, query_timeout: Duration) -> DnsResult<Self> {
        Self::with_addr(endpoint.socket_addr()?, query_timeout)
    }

    /// Create a client for a socket address
    ///
    /// # Errors
    ///
    /// `DnsError::ConfigError` if the fallback TCP pool cannot be built.
    pub fn with_addr(server_addr: SocketAddr, query_timeout: Duration) -> DnsResult<Self> {
        Ok(Self {
            address: format!("udp://{server_addr}"),
            server_addr,
            timeout: query_timeout,
            tcp_fallback: TcpClient::with_addr(server_addr, query_timeout)?,
        })
    }

    /// Server socket address
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    async fn query_once(&self, query_bytes: &[u8], query: &Message, deadline: Duration) -> DnsResult<Message> {
        let bind_addr: SocketAddr = if self.server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::network_io("failed to bind UDP socket", e))?;
        socket
            .connect(self.server_addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to connect UDP socket to {}", self.server_addr), e))?;
        socket
            .send(query_bytes)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to send UDP query to {}", self.server_addr), e))?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let receive = async {
            loop {
                let len = socket.recv(&mut buf).await.map_err(|e| {
                    DnsError::network_io(format!("failed to receive UDP response from {}", self.server_addr), e)
                })?;
                // Ignore stray datagrams (wrong ID/question) and keep waiting.
                match Message::from_vec(&buf[..len]) {
                    Ok(response) if validate_response(query, &response) => return Ok::<_, DnsError>(response),
                    Ok(_) => debug!(upstream = %self.address, "ignoring mismatched UDP response"),
                    Err(e) => debug!(upstream = %self.address, error = %e, "ignoring undecodable UDP response"),
                }
            }
        };

        timeout(deadline, receive)
            .await
            .map_err(|_| DnsError::timeout(format!("UDP query to {}", self.server_addr), deadline))?
    }
}

#[async_trait]
impl DnsUpstream for UdpClient {
    async fn query(&self, query: &Message) -> DnsResult<Message> {
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::serialize(format!("failed to serialize DNS query: {e}")))?;

        let started = Instant::now();
        let per_attempt = self.timeout / UDP_ATTEMPTS;
        let mut last_error = None;

        for attempt in 1..=UDP_ATTEMPTS {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match self.query_once(&query_bytes, query, per_attempt.min(remaining)).await {
                Ok(response) if response.truncated() => {
                    debug!(upstream = %self.address, "UDP answer truncated, retrying over TCP");
                    return self.tcp_fallback.query(query).await;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(upstream = %self.address, attempt, error = %e, "UDP query attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DnsError::timeout(format!("UDP query to {}", self.server_addr), self.timeout)))
    }

    fn protocol(&self) -> UpstreamProtocol {
        UpstreamProtocol::Udp
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
