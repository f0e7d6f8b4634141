//! DNS-over-HTTPS (`DoH`) client
//!
//! RFC 8484 POST requests with an `application/dns-message` body, sent
//! through a shared hyper client (HTTP/2 when the server offers it).

#[cfg(feature = "dns-doh")]
mod inner {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use hickory_proto::op::Message;
    use http::{header, Method, Request, Uri};
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tokio::time::timeout;

    use crate::dns::client::traits::{validate_response, DnsUpstream, MAX_TCP_MESSAGE_SIZE};
    use crate::dns::client::webpki_client_config;
    use crate::dns::config::{Endpoint, UpstreamProtocol};
    use crate::dns::error::{DnsError, DnsResult};

    /// Wire-format media type
    pub const DOH_CONTENT_TYPE: &str = "application/dns-message";

    type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

    /// DNS-over-HTTPS client
    pub struct DohClient {
        uri: Uri,
        address: String,
        client: HttpsClient,
        query_timeout: Duration,
    }

    impl std::fmt::Debug for DohClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DohClient")
                .field("uri", &self.address)
                .field("query_timeout", &self.query_timeout)
                .finish()
        }
    }

    impl DohClient {
        /// Create a client for a parsed `https://` endpoint
        ///
        /// # Errors
        ///
        /// `DnsError::ConfigError` if the endpoint has no URL or the URL is
        /// not an `https` URI.
        pub fn new(endpoint: &Endpoint, query_timeout: Duration) -> DnsResult<Self> {
            let url = endpoint
                .url
                .as_deref()
                .ok_or_else(|| DnsError::config_field("DoH upstream requires a URL", "upstream.address"))?;
            let uri = parse_uri(url)?;
            if uri.scheme_str() != Some("https") {
                return Err(DnsError::config_field(
                    format!("DoH URL must use HTTPS scheme: {url}"),
                    "upstream.address",
                ));
            }
            Self::with_uri(uri, query_timeout)
        }

        /// Create a client for any `http`/`https` URI (plain HTTP is for
        /// local testing)
        ///
        /// # Errors
        ///
        /// `DnsError::ConfigError` if the TLS configuration cannot be built.
        pub fn with_uri(uri: Uri, query_timeout: Duration) -> DnsResult<Self> {
            let https = HttpsConnectorBuilder::new()
                .with_tls_config(webpki_client_config()?)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build();
            let client = Client::builder(TokioExecutor::new()).build(https);

            Ok(Self {
                address: uri.to_string(),
                uri,
                client,
                query_timeout,
            })
        }

        /// The request URI
        #[must_use]
        pub fn uri(&self) -> &Uri {
            &self.uri
        }

        async fn query_post(&self, query: &Message) -> DnsResult<Message> {
            let query_bytes = query
                .to_vec()
                .map_err(|e| DnsError::serialize(format!("failed to serialize DNS query: {e}")))?;

            let request = Request::builder()
                .method(Method::POST)
                .uri(self.uri.clone())
                .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
                .header(header::ACCEPT, DOH_CONTENT_TYPE)
                .body(Full::new(Bytes::from(query_bytes)))
                .map_err(|e| DnsError::internal(format!("failed to build DoH request: {e}")))?;

            let response = timeout(self.query_timeout, self.client.request(request))
                .await
                .map_err(|_| DnsError::timeout(format!("DoH request to {}", self.uri), self.query_timeout))?
                .map_err(|e| DnsError::upstream(&self.address, format!("DoH request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(DnsError::upstream(&self.address, format!("DoH request returned HTTP {status}")));
            }
            if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
                let ct = content_type.to_str().unwrap_or("");
                if !ct.starts_with(DOH_CONTENT_TYPE) {
                    return Err(DnsError::upstream(&self.address, format!("unexpected Content-Type: {ct}")));
                }
            }

            let body = self.collect_body(response.into_body()).await?;
            if body.len() > MAX_TCP_MESSAGE_SIZE {
                return Err(DnsError::parse(format!(
                    "DoH response too large: {} bytes (max {MAX_TCP_MESSAGE_SIZE})",
                    body.len()
                )));
            }

            let response = Message::from_vec(&body)
                .map_err(|e| DnsError::parse(format!("failed to parse DoH DNS response: {e}")))?;
            if !validate_response(query, &response) {
                return Err(DnsError::upstream(
                    &self.address,
                    "response validation failed (ID or QNAME mismatch)",
                ));
            }
            Ok(response)
        }

        async fn collect_body(&self, body: Incoming) -> DnsResult<Bytes> {
            let collected = timeout(self.query_timeout, body.collect())
                .await
                .map_err(|_| DnsError::timeout(format!("DoH response body from {}", self.uri), self.query_timeout))?
                .map_err(|e| DnsError::upstream(&self.address, format!("failed to read DoH response body: {e}")))?;
            Ok(collected.to_bytes())
        }
    }

    fn parse_uri(url: &str) -> DnsResult<Uri> {
        url.parse()
            .map_err(|e| DnsError::config_field(format!("invalid DoH URL '{url}': {e}"), "upstream.address"))
    }

    #[async_trait]
    impl DnsUpstream for DohClient {
        async fn query(&self, query: &Message) -> DnsResult<Message> {
            self.query_post(query).await
        }

        fn protocol(&self) -> UpstreamProtocol {
            UpstreamProtocol::Doh
        }

        fn address(&self) -> &str {
            &self.address
        }

        fn timeout(&self) -> Duration {
            self.query_timeout
        }
    }

}

#[cfg(feature = "dns-doh")]
pub use inner::{DohClient, DOH_CONTENT_TYPE};
