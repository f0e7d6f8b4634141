//! Hot-reloadable routing engine
//!
//! The engine holds an immutable [`RoutingSnapshot`] behind `ArcSwap`.
//! Every query loads the snapshot once and runs both decision passes
//! against it, so a concurrent reload can never split a query across two
//! rule sets.
//!
//! ```text
//! Query -> Router::snapshot() -> Arc<RoutingSnapshot>
//!                                   |-- decide_pre(name)                (before forwarding)
//!                                   `-- decide_post(name, addrs, &pre)  (after forwarding)
//!
//! Reload -> Router::reload() -> ArcSwap::store()   old snapshot dropped
//!                                                   when readers finish
//! ```
//!
//! # Decision order
//!
//! 1. Exact override entry (always wins, never revisited)
//! 2. Rules in file order; address rules are skipped until addresses
//!    are known
//! 3. Default policy
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use doh_autoproxy::geo::GeoStore;
//! use doh_autoproxy::rules::{Policy, Router, RoutingSnapshotBuilder, RuleList};
//! use std::path::Path;
//!
//! let rules = RuleList::parse("domain:example.cn domestic\n", Path::new("rules.txt")).unwrap();
//! let snapshot = RoutingSnapshotBuilder::new(Arc::new(GeoStore::default()))
//!     .rules(rules)
//!     .default_policy(Policy::parse("overseas"))
//!     .build();
//! let router = Router::new(snapshot);
//!
//! assert_eq!(router.decide_pre("www.example.cn").policy, Policy::parse("domestic"));
//! assert_eq!(router.decide_pre("example.org").policy, Policy::parse("overseas"));
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::trace;

use super::hosts::HostsTable;
use super::list::RuleList;
use super::types::{Decision, MatchedBy, Policy};
use crate::error::RuleError;
use crate::geo::{normalize_name, GeoStore};

/// Immutable routing configuration
pub struct RoutingSnapshot {
    geo: Arc<GeoStore>,
    hosts: HostsTable,
    rules: RuleList,
    default_policy: Policy,
    has_address_rules: bool,
    /// Configuration version (for logging)
    pub version: u64,
}

impl RoutingSnapshot {
    /// Pre-resolution decision: override, then name rules, then default
    #[must_use]
    pub fn decide_pre(&self, name: &str) -> Decision {
        self.decide(name, None)
    }

    /// Post-resolution decision
    ///
    /// Walks the full rule list with `addrs` known. The pre decision is
    /// replaced only when the first matching rule is an address rule with
    /// a different policy; override decisions are never revisited.
    #[must_use]
    pub fn decide_post(&self, name: &str, addrs: &[IpAddr], pre: &Decision) -> Decision {
        if pre.is_override() || addrs.is_empty() || !self.has_address_rules {
            return pre.clone();
        }
        let post = self.decide(name, Some(addrs));
        if post.is_address_rule() && post.policy != pre.policy {
            trace!(name, pre = %pre.policy, post = %post.policy, by = %post.matched_by, "Post-resolution policy change");
            post
        } else {
            pre.clone()
        }
    }

    /// Single-pass decision with optional answer addresses
    ///
    /// With `addrs == None` address rules are skipped; otherwise an address
    /// rule matches when any of the addresses satisfies it.
    #[must_use]
    pub fn decide(&self, name: &str, addrs: Option<&[IpAddr]>) -> Decision {
        let name = normalize_name(name);

        if let Some(policy) = self.hosts.get(&name) {
            return Decision::new(policy.clone(), MatchedBy::Override);
        }

        for (index, rule) in self.rules.rules().iter().enumerate() {
            let address = rule.condition.requires_address();
            let hit = if address {
                addrs.is_some_and(|addrs| addrs.iter().any(|a| rule.condition.matches_addr(*a, &self.geo)))
            } else {
                rule.condition.matches_name(&name, &self.geo)
            };
            if hit {
                return Decision::new(
                    rule.policy.clone(),
                    MatchedBy::Rule {
                        index,
                        condition: Arc::clone(rule.label()),
                        address,
                    },
                );
            }
        }

        Decision::new(self.default_policy.clone(), MatchedBy::Default)
    }

    /// Whether any rule needs answer addresses (enables the post pass)
    #[must_use]
    pub const fn has_address_rules(&self) -> bool {
        self.has_address_rules
    }

    /// Default policy
    #[must_use]
    pub const fn default_policy(&self) -> &Policy {
        &self.default_policy
    }

    /// Geo store backing category/region conditions
    #[must_use]
    pub fn geo(&self) -> &GeoStore {
        &self.geo
    }

    /// Upstream groups referenced anywhere in the snapshot
    #[must_use]
    pub fn referenced_groups(&self) -> BTreeSet<&str> {
        self.hosts
            .iter()
            .map(|(_, p)| p)
            .chain(self.rules.rules().iter().map(|r| &r.policy))
            .chain(std::iter::once(&self.default_policy))
            .filter_map(Policy::group)
            .collect()
    }

    /// Check that every forwarding policy names a known group
    ///
    /// # Errors
    ///
    /// `RuleError::UnknownPolicy` for the first unknown group, naming where
    /// it was referenced.
    pub fn validate_policies<F>(&self, is_known: F) -> Result<(), RuleError>
    where
        F: Fn(&str) -> bool,
    {
        if let Some(group) = self.default_policy.group() {
            if !is_known(group) {
                return Err(RuleError::unknown_policy(group, "default_policy"));
            }
        }
        for (name, policy) in self.hosts.iter() {
            if let Some(group) = policy.group() {
                if !is_known(group) {
                    return Err(RuleError::unknown_policy(group, format!("override for '{name}'")));
                }
            }
        }
        for (index, rule) in self.rules.rules().iter().enumerate() {
            if let Some(group) = rule.policy.group() {
                if !is_known(group) {
                    return Err(RuleError::unknown_policy(group, format!("rule #{} ({})", index + 1, rule.condition)));
                }
            }
        }
        Ok(())
    }

    /// Summary counters for logging
    #[must_use]
    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            overrides: self.hosts.len(),
            rules: self.rules.len(),
            address_rules: self
                .rules
                .rules()
                .iter()
                .filter(|r| r.condition.requires_address())
                .count(),
            regions: self.geo.regions().region_count(),
            categories: self.geo.sites().len(),
            version: self.version,
        }
    }
}

/// Counters describing a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub overrides: usize,
    pub rules: usize,
    pub address_rules: usize,
    pub regions: usize,
    pub categories: usize,
    pub version: u64,
}

/// Builder for [`RoutingSnapshot`]
pub struct RoutingSnapshotBuilder {
    geo: Arc<GeoStore>,
    hosts: HostsTable,
    rules: RuleList,
    default_policy: Policy,
    version: u64,
}

impl RoutingSnapshotBuilder {
    /// Start from a geo store with no overrides, no rules and a `block` default
    #[must_use]
    pub fn new(geo: Arc<GeoStore>) -> Self {
        Self {
            geo,
            hosts: HostsTable::new(),
            rules: RuleList::new(),
            default_policy: Policy::Block,
            version: 0,
        }
    }

    #[must_use]
    pub fn hosts(mut self, hosts: HostsTable) -> Self {
        self.hosts = hosts;
        self
    }

    #[must_use]
    pub fn rules(mut self, rules: RuleList) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn default_policy(mut self, policy: Policy) -> Self {
        self.default_policy = policy;
        self
    }

    #[must_use]
    pub const fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn build(self) -> RoutingSnapshot {
        RoutingSnapshot {
            has_address_rules: self.rules.has_address_rules(),
            geo: self.geo,
            hosts: self.hosts,
            rules: self.rules,
            default_policy: self.default_policy,
            version: self.version,
        }
    }
}

/// Shared routing engine
///
/// Reads are lock-free; [`Router::reload`] publishes a new snapshot
/// atomically.
pub struct Router {
    snapshot: ArcSwap<RoutingSnapshot>,
}

impl fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("default_policy", &self.default_policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("Router")
            .field("version", &snapshot.version)
            .field("stats", &snapshot.stats())
            .finish()
    }
}

impl Router {
    #[must_use]
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot
    ///
    /// Hold the returned `Arc` for the whole query so both passes see the
    /// same rules.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// Swap in a new snapshot
    pub fn reload(&self, snapshot: RoutingSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// See [`RoutingSnapshot::decide_pre`]
    #[must_use]
    pub fn decide_pre(&self, name: &str) -> Decision {
        self.snapshot.load().decide_pre(name)
    }

    /// See [`RoutingSnapshot::decide_post`]
    #[must_use]
    pub fn decide_post(&self, name: &str, addrs: &[IpAddr], pre: &Decision) -> Decision {
        self.snapshot.load().decide_post(name, addrs, pre)
    }

    /// See [`RoutingSnapshot::decide`]
    #[must_use]
    pub fn decide(&self, name: &str, addrs: Option<&[IpAddr]>) -> Decision {
        self.snapshot.load().decide(name, addrs)
    }

    /// Version of the current snapshot
    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{RegionTable, SiteCategoryTable, SiteMatcher};
    use std::path::Path;

    fn geo() -> Arc<GeoStore> {
        let mut regions = RegionTable::builder();
        regions
            .insert("1.0.0.0/8".parse().unwrap(), "cn")
            .insert("8.8.8.0/24".parse().unwrap(), "us")
            .insert("2001:4860::/32".parse().unwrap(), "us");
        let mut sites = SiteCategoryTable::new();
        sites.insert(
            "streaming",
            SiteMatcher::builder("streaming")
                .add_domain("netflix.com")
                .add_keyword("hulu")
                .build()
                .unwrap(),
        );
        sites.insert("cn", SiteMatcher::builder("cn").add_domain("cn").build().unwrap());
        Arc::new(GeoStore::from_tables(regions.build(), sites))
    }

    fn snapshot(hosts: &str, rules: &str, default: &str) -> RoutingSnapshot {
        RoutingSnapshotBuilder::new(geo())
            .hosts(HostsTable::parse(hosts, Path::new("hosts.txt")).unwrap())
            .rules(RuleList::parse(rules, Path::new("rules.txt")).unwrap())
            .default_policy(Policy::parse(default))
            .version(1)
            .build()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_override_beats_every_rule() {
        let snap = snapshot(
            "blocked.example block\nforced.example 10.9.9.9\n",
            "full:blocked.example proxy\nkeyword:example proxy\nregion:US proxy\n",
            "direct",
        );

        let pre = snap.decide_pre("blocked.example");
        assert_eq!(pre.policy, Policy::Block);
        assert!(pre.is_override());

        let post = snap.decide_post("blocked.example", &[ip("8.8.8.8")], &pre);
        assert_eq!(post, pre);

        let forced = snap.decide_pre("Forced.Example.");
        assert!(matches!(forced.policy, Policy::Local(_)));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let a = snapshot("", "keyword:video first\ndomain:video.example second\n", "default");
        let b = snapshot("", "domain:video.example second\nkeyword:video first\n", "default");

        assert_eq!(a.decide_pre("video.example").policy, Policy::parse("first"));
        assert_eq!(b.decide_pre("video.example").policy, Policy::parse("second"));
        assert_eq!(
            a.decide_pre("video.example").matched_by,
            MatchedBy::Rule {
                index: 0,
                condition: "keyword:video".into(),
                address: false
            }
        );
    }

    #[test]
    fn test_pre_pass_skips_address_rules() {
        let snap = snapshot("", "region:US overseas\ncategory:cn domestic\n", "fallback");
        let pre = snap.decide_pre("www.example.cn");
        assert_eq!(pre.policy, Policy::parse("domestic"));

        let pre = snap.decide_pre("example.org");
        assert_eq!(pre.matched_by, MatchedBy::Default);
    }

    #[test]
    fn test_post_pass_switches_on_region() {
        let snap = snapshot(
            "",
            "category:streaming policyA\nregion:US policyB\n",
            "policyC",
        );
        let pre = snap.decide_pre("api.example.org");
        assert_eq!(pre.policy, Policy::parse("policyC"));

        let post = snap.decide_post("api.example.org", &[ip("192.0.2.1"), ip("8.8.8.8")], &pre);
        assert_eq!(post.policy, Policy::parse("policyB"));
        assert!(post.is_address_rule());

        let v6 = snap.decide_post("api.example.org", &[ip("2001:4860::8888")], &pre);
        assert_eq!(v6.policy, Policy::parse("policyB"));

        let unchanged = snap.decide_post("api.example.org", &[ip("1.2.3.4")], &pre);
        assert_eq!(unchanged, pre);
    }

    #[test]
    fn test_post_pass_keeps_earlier_name_rule() {
        let snap = snapshot("", "category:streaming policyA\nregion:US policyB\n", "policyC");
        let pre = snap.decide_pre("www.netflix.com");
        assert_eq!(pre.policy, Policy::parse("policyA"));

        let post = snap.decide_post("www.netflix.com", &[ip("8.8.8.8")], &pre);
        assert_eq!(post.policy, Policy::parse("policyA"));
    }

    #[test]
    fn test_post_pass_address_rule_before_name_rule() {
        let snap = snapshot("", "cidr:10.0.0.0/8 lan\ncategory:streaming policyA\n", "policyC");
        let pre = snap.decide_pre("www.netflix.com");
        assert_eq!(pre.policy, Policy::parse("policyA"));

        let post = snap.decide_post("www.netflix.com", &[ip("10.1.1.1")], &pre);
        assert_eq!(post.policy, Policy::parse("lan"));
    }

    #[test]
    fn test_validate_policies() {
        let snap = snapshot("a.example office\n", "region:US overseas\nkeyword:ads block\n", "domestic");
        let known = ["office", "overseas", "domestic"];
        assert!(snap.validate_policies(|g| known.contains(&g)).is_ok());

        let err = snap
            .validate_policies(|g| g != "overseas")
            .unwrap_err();
        assert!(matches!(err, RuleError::UnknownPolicy { ref policy, .. } if policy == "overseas"));

        let err = snap.validate_policies(|g| g != "domestic").unwrap_err();
        assert!(err.to_string().contains("default_policy"));

        let groups: Vec<_> = snap.referenced_groups().into_iter().collect();
        assert_eq!(groups, vec!["domestic", "office", "overseas"]);
    }

    #[test]
    fn test_reload_is_atomic_and_deterministic() {
        let router = Router::new(snapshot("", "category:streaming a\n", "b"));
        let before: Vec<_> = ["www.netflix.com", "hulu.example", "x.org"]
            .iter()
            .map(|n| router.decide_pre(n))
            .collect();

        let held = router.snapshot();
        router.reload(snapshot("", "category:streaming a\n", "b"));
        let after: Vec<_> = ["www.netflix.com", "hulu.example", "x.org"]
            .iter()
            .map(|n| router.decide_pre(n))
            .collect();
        assert_eq!(before, after);

        router.reload(snapshot("", "", "b").into_version(7));
        assert_eq!(router.version(), 7);
        assert_eq!(held.decide_pre("www.netflix.com").policy, Policy::parse("a"));
        assert_eq!(router.decide_pre("www.netflix.com").policy, Policy::parse("b"));
    }

    #[test]
    fn test_stats() {
        let snap = snapshot("x.example block\n", "region:US a\nip:10.0.0.0/8 b\ndomain:c.example c\n", "d");
        let stats = snap.stats();
        assert_eq!(stats.overrides, 1);
        assert_eq!(stats.rules, 3);
        assert_eq!(stats.address_rules, 2);
        assert!(snap.has_address_rules());
        assert_eq!(stats.regions, 2);
        assert_eq!(stats.categories, 2);
    }

    #[test]
    fn test_rule_label_shared_across_decisions() {
        let snap = snapshot("", "domain:c.example c\n", "d");
        let label = |name| match snap.decide_pre(name).matched_by {
            MatchedBy::Rule { condition, .. } => condition,
            other => panic!("unexpected {other:?}"),
        };
        let (first, second) = (label("a.c.example"), label("b.c.example"));
        assert_eq!(&*first, "domain:c.example");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_debug_shows_version_and_stats() {
        let router = Router::new(snapshot("", "region:US a\n", "b").into_version(3));
        let shown = format!("{router:?}");
        assert!(shown.starts_with("Router"));
        assert!(shown.contains("version: 3"));
        assert!(shown.contains("rules: 1"));
        assert!(format!("{:?}", router.snapshot()).starts_with("RoutingSnapshot"));
    }

    impl RoutingSnapshot {
        fn into_version(mut self, version: u64) -> Self {
            self.version = version;
            self
        }
    }
}
