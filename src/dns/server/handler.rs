//! DNS query handler
//!
//! The one capability shared by every front-end. Framing differs per
//! transport; everything between "bytes in" and "bytes out" happens here.
//!
//! ```text
//! bytes ──> decode ──> validate ──> decide_pre ──> forward ──┐
//!             │           │                                  │
//!          FORMERR     FORMERR          A/AAAA answer + address rules?
//!                                         │ yes                │ no
//!                                   decide_post ── same ───────┤
//!                                         │ changed            │
//!                                   forward again ─────────────┴──> encode
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use tracing::{debug, trace, warn};

use crate::dns::client::MAX_UDP_MESSAGE_SIZE;
use crate::dns::dispatch::Dispatcher;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::response;
use crate::rules::{Decision, Router};

/// Minimum DNS header size
const DNS_HEADER_SIZE: usize = 12;

/// Upper bound on the EDNS payload size we honour for UDP
pub const MAX_EDNS_UDP_SIZE: usize = 4096;

/// Maximum domain name length (RFC 1035)
const MAX_DOMAIN_LENGTH: usize = 253;

/// Maximum label length (RFC 1035)
const MAX_LABEL_LENGTH: usize = 63;

/// Front-end a query arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Dot,
    Doq,
    Doh,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Dot => "dot",
            Self::Doq => "doq",
            Self::Doh => "doh",
        })
    }
}

/// Where a query came from
#[derive(Debug, Clone, Copy)]
pub struct QueryContext {
    pub client: SocketAddr,
    pub transport: Transport,
}

impl QueryContext {
    #[must_use]
    pub const fn new(client: SocketAddr, transport: Transport) -> Self {
        Self { client, transport }
    }
}

/// A forwarded answer and the decision that produced it
#[derive(Debug, Clone)]
pub struct Resolved {
    pub reply: Message,
    /// Final decision (the post-resolution one when the query was re-routed)
    pub decision: Decision,
    pub rerouted: bool,
}

impl Resolved {
    /// Upstream group that produced the reply, if any
    #[must_use]
    pub fn upstream_group(&self) -> Option<&str> {
        self.decision.policy.group()
    }
}

/// Handler counters
#[derive(Debug, Default)]
pub struct HandlerStats {
    queries_received: AtomicU64,
    queries_answered: AtomicU64,
    malformed: AtomicU64,
    servfail: AtomicU64,
    rerouted: AtomicU64,
}

impl HandlerStats {
    /// Snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            queries_answered: self.queries_answered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            servfail: self.servfail.load(Ordering::Relaxed),
            rerouted: self.rerouted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`HandlerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStatsSnapshot {
    pub queries_received: u64,
    pub queries_answered: u64,
    /// Dropped or answered with FORMERR
    pub malformed: u64,
    pub servfail: u64,
    /// Queries re-forwarded after the post-resolution decision changed
    pub rerouted: u64,
}

/// Shared query handler
#[derive(Debug)]
pub struct DnsHandler {
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    stats: HandlerStats,
}

impl DnsHandler {
    #[must_use]
    pub fn new(router: Arc<Router>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            router,
            dispatcher,
            stats: HandlerStats::default(),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    /// Answer one wire-format query
    ///
    /// Returns `None` when the input is too short to carry a header; the
    /// front-end then sends nothing. UDP answers are truncated to the
    /// client's advertised limit.
    pub async fn handle(&self, ctx: &QueryContext, data: &[u8]) -> Option<Vec<u8>> {
        let started = Instant::now();
        self.stats.queries_received.fetch_add(1, Ordering::Relaxed);

        if data.len() < DNS_HEADER_SIZE {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            trace!(client = %ctx.client, transport = %ctx.transport, len = data.len(), "dropping runt query");
            return None;
        }
        let id = u16::from_be_bytes([data[0], data[1]]);

        let query = match Message::from_vec(data) {
            Ok(query) => query,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(client = %ctx.client, transport = %ctx.transport, error = %e, "undecodable query");
                return encode(&response::header_only(id, ResponseCode::FormErr));
            }
        };

        if let Err(e) = validate_query(&query) {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(client = %ctx.client, transport = %ctx.transport, error = %e, "invalid query");
            let mut reply = response::response_to(&query);
            reply.set_response_code(ResponseCode::FormErr);
            return encode(&reply);
        }

        let reply = match self.resolve(ctx, &query).await {
            Ok(resolved) => {
                self.stats.queries_answered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    client = %ctx.client,
                    transport = %ctx.transport,
                    policy = %resolved.decision.policy,
                    by = %resolved.decision.matched_by,
                    upstream = resolved.upstream_group().unwrap_or("-"),
                    rerouted = resolved.rerouted,
                    rcode = %resolved.reply.response_code(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "query answered"
                );
                resolved.reply
            }
            Err(e) => {
                self.stats.servfail.fetch_add(1, Ordering::Relaxed);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if e.is_unavailable() {
                    debug!(client = %ctx.client, error = %e, elapsed_ms, "answering SERVFAIL");
                } else {
                    warn!(client = %ctx.client, error = %e, elapsed_ms, "answering SERVFAIL");
                }
                response::servfail(&query)
            }
        };

        let bytes = encode(&reply)?;
        if ctx.transport == Transport::Udp {
            return Some(truncate_for_udp(&query, bytes, client_udp_limit(&query)));
        }
        Some(bytes)
    }

    /// Route and forward a validated query
    ///
    /// # Errors
    ///
    /// Forwarding errors from the dispatcher (`UpstreamUnavailable`,
    /// `UnknownPolicy`).
    pub async fn resolve(&self, ctx: &QueryContext, query: &Message) -> DnsResult<Resolved> {
        let q = query
            .queries()
            .first()
            .ok_or_else(|| DnsError::invalid_query("query has no question"))?;
        let name = q.name().to_ascii();
        let snapshot = self.router.snapshot();

        let pre = snapshot.decide_pre(&name);
        debug!(
            client = %ctx.client,
            transport = %ctx.transport,
            name = %name,
            qtype = %q.query_type(),
            policy = %pre.policy,
            by = %pre.matched_by,
            "routing query"
        );

        let reply = self.dispatcher.forward(&pre.policy, query).await?;
        let unchanged = |reply| Resolved {
            reply,
            decision: pre.clone(),
            rerouted: false,
        };
        if !snapshot.has_address_rules() || pre.is_override() || pre.policy.is_terminal() {
            return Ok(unchanged(reply));
        }

        let addrs = response::answer_addrs(&reply);
        if addrs.is_empty() {
            return Ok(unchanged(reply));
        }
        let post = snapshot.decide_post(&name, &addrs, &pre);
        if post.policy == pre.policy {
            return Ok(unchanged(reply));
        }

        self.stats.rerouted.fetch_add(1, Ordering::Relaxed);
        debug!(name = %name, from = %pre.policy, to = %post.policy, by = %post.matched_by, "re-routing after resolution");
        let reply = self.dispatcher.forward(&post.policy, query).await?;
        Ok(Resolved {
            reply,
            decision: post,
            rerouted: true,
        })
    }
}

/// Structural checks on a decoded query
///
/// # Errors
///
/// `DnsError::InvalidQuery` for a response message, a non-QUERY opcode,
/// a question count other than one, or a name exceeding RFC 1035 limits.
pub fn validate_query(query: &Message) -> DnsResult<()> {
    if query.message_type() != MessageType::Query {
        return Err(DnsError::invalid_query_id("QR bit set on query", query.id()));
    }
    if query.op_code() != OpCode::Query {
        return Err(DnsError::invalid_query_id(
            format!("unsupported opcode {:?}", query.op_code()),
            query.id(),
        ));
    }
    if query.queries().len() != 1 {
        return Err(DnsError::invalid_query_id(
            format!("expected exactly one question, got {}", query.queries().len()),
            query.id(),
        ));
    }

    let name = query.queries()[0].name().to_ascii();
    let name = name.trim_end_matches('.');
    if name.len() > MAX_DOMAIN_LENGTH {
        return Err(DnsError::invalid_query_id(format!("name exceeds {MAX_DOMAIN_LENGTH} bytes"), query.id()));
    }
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
                return Err(DnsError::invalid_query_id(format!("invalid label in '{name}'"), query.id()));
            }
        }
    }
    Ok(())
}

/// UDP response limit: 512 without EDNS, the advertised size otherwise
/// (clamped to `[512, 4096]`)
#[must_use]
pub fn client_udp_limit(query: &Message) -> usize {
    query.extensions().as_ref().map_or(MAX_UDP_MESSAGE_SIZE, |edns| {
        usize::from(edns.max_payload()).clamp(MAX_UDP_MESSAGE_SIZE, MAX_EDNS_UDP_SIZE)
    })
}

/// Replace an oversized UDP answer with header + question and TC set
#[must_use]
pub fn truncate_for_udp(query: &Message, bytes: Vec<u8>, limit: usize) -> Vec<u8> {
    if bytes.len() <= limit {
        return bytes;
    }
    debug!(id = query.id(), size = bytes.len(), limit, "truncating UDP response");
    let mut truncated = response::response_to(query);
    truncated.set_truncated(true);
    if let Some(rcode) = Message::from_vec(&bytes).ok().map(|m| m.response_code()) {
        truncated.set_response_code(rcode);
    }
    encode(&truncated).unwrap_or(bytes)
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(id = message.id(), error = %e, "failed to encode response");
            None
        }
    }
}
