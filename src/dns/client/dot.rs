//! DNS-over-TLS (`DoT`) client
//!
//! RFC 7858 queries over pooled TLS connections. Framing is the same
//! two-byte length prefix as plain TCP.

#[cfg(feature = "dns-dot")]
mod inner {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use deadpool::managed::{self, Manager, Object, Pool, RecycleError, RecycleResult};
    use hickory_proto::op::Message;
    use rustls::pki_types::ServerName;
    use rustls::ClientConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;
    use tracing::debug;

    use crate::dns::client::traits::{validate_response, DnsUpstream, MAX_TCP_MESSAGE_SIZE};
    use crate::dns::client::webpki_client_config;
    use crate::dns::config::{Endpoint, UpstreamProtocol};
    use crate::dns::error::{DnsError, DnsResult};
    use crate::dns::framing::{read_frame, write_frame};

    const DEFAULT_POOL_SIZE: usize = 4;

    const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

    type TlsConnection = TlsStream<TcpStream>;

    struct DotConnectionManager {
        server_addr: SocketAddr,
        server_name: ServerName<'static>,
        tls_connector: TlsConnector,
        connect_timeout: Duration,
    }

    #[async_trait]
    impl Manager for DotConnectionManager {
        type Type = TlsConnection;
        type Error = DnsError;

        async fn create(&self) -> Result<TlsConnection, DnsError> {
            let tcp_stream = timeout(self.connect_timeout, TcpStream::connect(self.server_addr))
                .await
                .map_err(|_| DnsError::timeout(format!("TCP connection to {}", self.server_addr), self.connect_timeout))?
                .map_err(|e| DnsError::network_io(format!("failed to connect to DoT server {}", self.server_addr), e))?;
            tcp_stream.set_nodelay(true).ok();

            let handshake = self.tls_connector.connect(self.server_name.clone(), tcp_stream);
            timeout(self.connect_timeout, handshake)
                .await
                .map_err(|_| DnsError::timeout(format!("TLS handshake with {}", self.server_addr), self.connect_timeout))?
                .map_err(|e| DnsError::network(format!("TLS handshake with {} failed: {e}", self.server_addr)))
        }

        async fn recycle(&self, conn: &mut TlsConnection, _metrics: &managed::Metrics) -> RecycleResult<DnsError> {
            // No try_read on a TLS stream; a 1ms read that times out means idle.
            let mut buf = [0u8; 1];
            match timeout(Duration::from_millis(1), conn.read(&mut buf)).await {
                Err(_) => Ok(()),
                Ok(Ok(0)) => Err(RecycleError::Message("DoT connection closed by server".to_string())),
                Ok(Ok(_)) => Err(RecycleError::Message("unexpected data on idle DoT connection".to_string())),
                Ok(Err(e)) => Err(RecycleError::Message(format!("DoT connection check failed: {e}"))),
            }
        }
    }

    /// DNS-over-TLS client
    ///
    /// Server certificates are verified against the webpki roots using the
    /// endpoint's SNI (or its host when no SNI is configured).
    pub struct DotClient {
        address: String,
        server_addr: SocketAddr,
        query_timeout: Duration,
        pool: Pool<DotConnectionManager>,
    }

    impl std::fmt::Debug for DotClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DotClient")
                .field("address", &self.address)
                .field("server_addr", &self.server_addr)
                .field("query_timeout", &self.query_timeout)
                .finish()
        }
    }

    impl DotClient {
        /// Create a client for a parsed `tls://` endpoint
        ///
        /// # Errors
        ///
        /// `DnsError::ConfigError` if the host does not resolve or the
        /// server name is not a valid DNS name or IP.
        pub fn new(endpoint: &Endpoint, query_timeout: Duration) -> DnsResult<Self> {
            let config = webpki_client_config()?;
            Self::with_tls_config(endpoint.socket_addr()?, endpoint.server_name(), Arc::new(config), query_timeout)
        }

        /// Create a client with an explicit TLS configuration
        ///
        /// # Errors
        ///
        /// `DnsError::ConfigError` on an invalid server name or pool setup.
        pub fn with_tls_config(
            server_addr: SocketAddr,
            server_name: &str,
            tls_config: Arc<ClientConfig>,
            query_timeout: Duration,
        ) -> DnsResult<Self> {
            let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
                DnsError::config_field(format!("invalid TLS server name '{server_name}': {e}"), "upstream.sni")
            })?;

            let manager = DotConnectionManager {
                server_addr,
                server_name: name,
                tls_connector: TlsConnector::from(tls_config),
                connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS).min(query_timeout),
            };
            let pool = Pool::builder(manager)
                .max_size(DEFAULT_POOL_SIZE)
                .build()
                .map_err(|e| DnsError::config(format!("failed to create DoT connection pool: {e}")))?;

            Ok(Self {
                address: format!("tls://{server_name}@{server_addr}"),
                server_addr,
                query_timeout,
                pool,
            })
        }

        async fn query_with_connection(&self, conn: &mut TlsConnection, query: &Message) -> DnsResult<Message> {
            let query_bytes = query
                .to_vec()
                .map_err(|e| DnsError::serialize(format!("failed to serialize DNS query: {e}")))?;
            if query_bytes.len() > MAX_TCP_MESSAGE_SIZE {
                return Err(DnsError::serialize(format!(
                    "DoT query too large: {} bytes (max {MAX_TCP_MESSAGE_SIZE})",
                    query_bytes.len()
                )));
            }

            let exchange = async {
                write_frame(conn, &query_bytes).await?;
                read_frame(conn).await
            };
            let frame = timeout(self.query_timeout, exchange)
                .await
                .map_err(|_| DnsError::timeout(format!("DoT query to {}", self.server_addr), self.query_timeout))?
                .map_err(|e| DnsError::network_io(format!("DoT exchange with {} failed", self.server_addr), e))?
                .ok_or_else(|| DnsError::network(format!("{} closed the DoT connection", self.server_addr)))?;

            let response = Message::from_vec(&frame)
                .map_err(|e| DnsError::parse(format!("failed to parse DoT DNS response: {e}")))?;
            if !validate_response(query, &response) {
                return Err(DnsError::upstream(
                    &self.address,
                    "response validation failed (ID or QNAME mismatch)",
                ));
            }
            Ok(response)
        }

        async fn checkout(&self) -> DnsResult<Object<DotConnectionManager>> {
            self.pool.get().await.map_err(|e| match e {
                managed::PoolError::Backend(inner) => inner,
                other => DnsError::upstream(&self.address, format!("failed to get DoT connection: {other}")),
            })
        }
    }

    #[async_trait]
    impl DnsUpstream for DotClient {
        async fn query(&self, query: &Message) -> DnsResult<Message> {
            let mut conn = self.checkout().await?;
            match self.query_with_connection(&mut conn, query).await {
                Ok(response) => Ok(response),
                Err(e) if e.is_recoverable() && !e.is_timeout() => {
                    let _ = Object::take(conn);
                    debug!(upstream = %self.address, error = %e, "retrying DoT query with fresh connection");
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
            UpstreamProtocol::Dot
        }

        fn address(&self) -> &str {
            &self.address
        }

        fn timeout(&self) -> Duration {
            self.query_timeout
        }
    }

}

#[cfg(feature = "dns-dot")]
pub use inner::DotClient;
