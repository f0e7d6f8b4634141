//! Query routing
//!
//! - [`hosts`]: override list, exact name to forced action
//! - [`list`]: ordered `(condition, policy)` rules
//! - [`engine`]: the two-pass decision over an atomically swapped snapshot
//! - [`types`]: [`Policy`] and [`Decision`]
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use std::sync::Arc;
//! use doh_autoproxy::geo::GeoStore;
//! use doh_autoproxy::rules::{HostsTable, Policy, RoutingSnapshotBuilder, RuleList};
//!
//! let hosts = HostsTable::parse("blocked.example block\n", Path::new("hosts.txt")).unwrap();
//! let rules = RuleList::parse("keyword:example overseas\n", Path::new("rules.txt")).unwrap();
//! let snapshot = RoutingSnapshotBuilder::new(Arc::new(GeoStore::default()))
//!     .hosts(hosts)
//!     .rules(rules)
//!     .default_policy(Policy::parse("domestic"))
//!     .build();
//!
//! assert_eq!(snapshot.decide_pre("blocked.example").policy, Policy::Block);
//! assert_eq!(snapshot.decide_pre("www.example.com").policy, Policy::parse("overseas"));
//! ```

pub mod engine;
pub mod hosts;
pub mod list;
pub mod types;

pub use engine::{Router, RoutingSnapshot, RoutingSnapshotBuilder, SnapshotStats};
pub use hosts::HostsTable;
pub use list::{Condition, Rule, RuleList};
pub use types::{Decision, MatchedBy, Policy, BLOCK, NXDOMAIN};
