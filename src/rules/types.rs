//! Core routing types
//!
//! - [`Policy`]: where a query goes (an upstream group or a terminal action)
//! - [`Decision`]: the policy chosen for one query plus what selected it
//! - [`MatchedBy`]: override, numbered rule, or the default

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Policy keyword that denies a query
pub const BLOCK: &str = "block";

/// Policy keyword that answers NXDOMAIN
pub const NXDOMAIN: &str = "nxdomain";

/// Routing target for a query
///
/// Everything except [`Policy::Group`] is answered locally without any
/// network call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Forward through the named upstream group
    Group(String),
    /// Deny (answered with NXDOMAIN)
    Block,
    /// Forced NXDOMAIN
    NxDomain,
    /// Forced address answer from the override list
    Local(Arc<[IpAddr]>),
}

impl Policy {
    /// Parse a policy token from a hosts/rule file or the config
    ///
    /// `block` and `nxdomain` are reserved (case-insensitive); anything
    /// else names an upstream group.
    ///
    /// # Example
    ///
    /// ```
    /// use doh_autoproxy::rules::Policy;
    ///
    /// assert_eq!(Policy::parse("BLOCK"), Policy::Block);
    /// assert_eq!(Policy::parse("overseas"), Policy::Group("overseas".into()));
    /// ```
    #[must_use]
    pub fn parse(token: &str) -> Self {
        if token.eq_ignore_ascii_case(BLOCK) {
            Self::Block
        } else if token.eq_ignore_ascii_case(NXDOMAIN) {
            Self::NxDomain
        } else {
            Self::Group(token.to_string())
        }
    }

    /// Whether this policy is answered without contacting an upstream
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Group(_))
    }

    /// Upstream group name, if this policy forwards
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Group(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(name) => write!(f, "{name}"),
            Self::Block => write!(f, "{BLOCK}"),
            Self::NxDomain => write!(f, "{NXDOMAIN}"),
            Self::Local(addrs) => {
                write!(f, "local[")?;
                for (i, addr) in addrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{addr}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// What produced a [`Decision`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchedBy {
    /// Exact entry in the override list
    Override,
    /// Rule at `index` (0-based file order)
    Rule {
        index: usize,
        /// Rule source text, e.g. `category:streaming`
        condition: Arc<str>,
        /// Whether the rule needs resolved addresses
        address: bool,
    },
    /// No rule matched
    Default,
}

impl fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::Rule {
                index, condition, ..
            } => write!(f, "rule#{index}({condition})"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Routing decision for one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Chosen policy
    pub policy: Policy,
    /// What selected it
    pub matched_by: MatchedBy,
}

impl Decision {
    /// Create a decision
    #[must_use]
    pub const fn new(policy: Policy, matched_by: MatchedBy) -> Self {
        Self { policy, matched_by }
    }

    /// Whether the decision came from the override list
    #[must_use]
    pub const fn is_override(&self) -> bool {
        matches!(self.matched_by, MatchedBy::Override)
    }

    /// Whether the decision came from an address-requiring rule
    #[must_use]
    pub const fn is_address_rule(&self) -> bool {
        matches!(self.matched_by, MatchedBy::Rule { address: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!(Policy::parse("block"), Policy::Block);
        assert_eq!(Policy::parse("NxDomain"), Policy::NxDomain);
        assert_eq!(Policy::parse("cn"), Policy::Group("cn".into()));
        assert!(Policy::Block.is_terminal());
        assert!(!Policy::parse("cn").is_terminal());
        assert_eq!(Policy::parse("cn").group(), Some("cn"));
    }

    #[test]
    fn test_policy_display() {
        let local = Policy::Local(Arc::from(vec![
            "10.0.0.1".parse::<IpAddr>().unwrap(),
            "::1".parse().unwrap(),
        ]));
        assert_eq!(local.to_string(), "local[10.0.0.1,::1]");
        assert_eq!(Policy::Block.to_string(), "block");
    }

    #[test]
    fn test_matched_by_display() {
        let by = MatchedBy::Rule {
            index: 2,
            condition: "region:US".into(),
            address: true,
        };
        assert_eq!(by.to_string(), "rule#2(region:US)");
        let decision = Decision::new(Policy::parse("us"), by);
        assert!(decision.is_address_rule());
        assert!(!decision.is_override());
    }
}
