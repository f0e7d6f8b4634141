//! Upstream dispatcher
//!
//! Maps a routing [`Policy`] to an answer. Terminal policies are answered
//! locally; a group policy walks that group's upstreams in configured
//! order until one returns a valid response.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hickory_proto::op::Message;
use tracing::{debug, trace};

use crate::dns::client::{build_upstream, DnsUpstream};
use crate::dns::config::UpstreamConfig;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::response;
use crate::rules::Policy;

/// Upstream groups keyed by policy name
#[derive(Debug, Default)]
pub struct Dispatcher {
    groups: HashMap<String, Vec<Arc<dyn DnsUpstream>>>,
}

impl Dispatcher {
    /// An empty dispatcher; add groups with [`Dispatcher::with_group`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured group
    ///
    /// # Errors
    ///
    /// The first upstream that fails to build, as `DnsError::ConfigError`.
    pub fn from_config(groups: &BTreeMap<String, Vec<UpstreamConfig>>) -> DnsResult<Self> {
        let mut dispatcher = Self::new();
        for (name, configs) in groups {
            let upstreams = configs
                .iter()
                .map(build_upstream)
                .collect::<DnsResult<Vec<_>>>()
                .map_err(|e| DnsError::config(format!("upstream group '{name}': {e}")))?;
            debug!(group = %name, upstreams = upstreams.len(), "built upstream group");
            dispatcher = dispatcher.with_group(name.clone(), upstreams);
        }
        Ok(dispatcher)
    }

    /// Add or replace a group
    #[must_use]
    pub fn with_group(mut self, name: impl Into<String>, upstreams: Vec<Arc<dyn DnsUpstream>>) -> Self {
        self.groups.insert(name.into(), upstreams);
        self
    }

    /// Whether a group with this name exists
    #[must_use]
    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Group names, sorted
    #[must_use]
    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Answer `query` according to `policy`
    ///
    /// # Errors
    ///
    /// - `DnsError::UnknownPolicy` if the group does not exist
    /// - `DnsError::UpstreamUnavailable` once every upstream of the group
    ///   has failed
    pub async fn forward(&self, policy: &Policy, query: &Message) -> DnsResult<Message> {
        let name = match policy {
            Policy::Block | Policy::NxDomain => return Ok(response::nxdomain(query)),
            Policy::Local(addrs) => return Ok(response::local_answer(query, addrs)),
            Policy::Group(name) => name,
        };

        let upstreams = self.groups.get(name).ok_or_else(|| DnsError::unknown_policy(name.as_str()))?;
        for (attempt, upstream) in upstreams.iter().enumerate() {
            match upstream.query(query).await {
                Ok(response) => {
                    trace!(group = %name, upstream = upstream.address(), rcode = ?response.response_code(), "upstream answered");
                    return Ok(response);
                }
                Err(e) => {
                    debug!(
                        group = %name,
                        upstream = upstream.address(),
                        attempt = attempt + 1,
                        error = %e,
                        "upstream failed, trying next"
                    );
                }
            }
        }
        Err(DnsError::unavailable(name.as_str(), upstreams.len()))
    }
}
