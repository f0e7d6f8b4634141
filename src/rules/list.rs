//! Rule list
//!
//! Ordered `<type>:<value> <policy>` lines; the first matching rule wins.
//!
//! | prefix                   | condition                         | needs address |
//! |--------------------------|-----------------------------------|---------------|
//! | `geosite:` `category:`   | name is in a site category        | no            |
//! | `domain:`                | name equals or is under a domain  | no            |
//! | `full:`                  | name equals exactly               | no            |
//! | `keyword:`               | name contains a substring         | no            |
//! | `regexp:`                | name matches a regex              | no            |
//! | `geoip:` `region:`       | an answer address is in a region  | yes           |
//! | `ip:` `cidr:`            | an answer address is in a CIDR    | yes           |

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;
use tracing::debug;

use super::hosts::strip_comment;
use super::types::Policy;
use crate::error::RuleError;
use crate::geo::GeoStore;

/// One rule condition
#[derive(Debug, Clone)]
pub enum Condition {
    /// Site category tag (lower case)
    Category(String),
    /// Domain and its subdomains (normalised)
    Domain(String),
    /// Exact name (normalised)
    Full(String),
    /// Substring of the name (lower case)
    Keyword(String),
    /// Regex over the normalised name
    Regex(Regex),
    /// Region code of an answer address (upper case)
    Region(String),
    /// Literal network containing an answer address
    Cidr(IpNet),
}

impl Condition {
    /// Parse a `<type>:<value>` token
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason; callers attach the file position.
    pub fn parse(token: &str) -> Result<Self, String> {
        let (kind, value) = token
            .split_once(':')
            .ok_or_else(|| format!("expected '<type>:<value>', found '{token}'"))?;
        if value.is_empty() {
            return Err(format!("empty value in '{token}'"));
        }

        let condition = match kind.to_ascii_lowercase().as_str() {
            "geosite" | "category" => Self::Category(value.to_ascii_lowercase()),
            "domain" => Self::Domain(normalize(value)),
            "full" => Self::Full(normalize(value)),
            "keyword" => Self::Keyword(value.to_ascii_lowercase()),
            "regexp" | "regex" => {
                Self::Regex(Regex::new(value).map_err(|e| format!("invalid regex '{value}': {e}"))?)
            }
            "geoip" | "region" => Self::Region(value.to_ascii_uppercase()),
            "ip" | "cidr" => Self::Cidr(parse_cidr(value)?),
            other => return Err(format!("unknown rule type '{other}'")),
        };
        Ok(condition)
    }

    /// Whether the condition is evaluated against answer addresses
    #[must_use]
    pub const fn requires_address(&self) -> bool {
        matches!(self, Self::Region(_) | Self::Cidr(_))
    }

    /// Evaluate a name condition; `name` must already be normalised
    ///
    /// Address conditions never match here.
    #[must_use]
    pub fn matches_name(&self, name: &str, geo: &GeoStore) -> bool {
        match self {
            Self::Category(tag) => geo.matches_category(name, tag),
            Self::Domain(domain) => is_subdomain_of(name, domain),
            Self::Full(full) => name == full,
            Self::Keyword(keyword) => name.contains(keyword.as_str()),
            Self::Regex(re) => re.is_match(name),
            Self::Region(_) | Self::Cidr(_) => false,
        }
    }

    /// Evaluate an address condition
    ///
    /// Name conditions never match here.
    #[must_use]
    pub fn matches_addr(&self, addr: IpAddr, geo: &GeoStore) -> bool {
        match self {
            Self::Region(code) => geo.resolve_region(addr) == Some(code.as_str()),
            Self::Cidr(net) => net.contains(&unmap(addr)),
            _ => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Category(tag) => write!(f, "category:{tag}"),
            Self::Domain(d) => write!(f, "domain:{d}"),
            Self::Full(d) => write!(f, "full:{d}"),
            Self::Keyword(k) => write!(f, "keyword:{k}"),
            Self::Regex(re) => write!(f, "regexp:{}", re.as_str()),
            Self::Region(code) => write!(f, "region:{code}"),
            Self::Cidr(net) => write!(f, "cidr:{net}"),
        }
    }
}

/// One `(condition, policy)` pair
#[derive(Debug, Clone)]
pub struct Rule {
    pub condition: Condition,
    pub policy: Policy,
    label: Arc<str>,
}

impl Rule {
    #[must_use]
    pub fn new(condition: Condition, policy: Policy) -> Self {
        let label = Arc::from(condition.to_string());
        Self {
            condition,
            policy,
            label,
        }
    }

    /// Condition source text, rendered once at parse time
    #[must_use]
    pub fn label(&self) -> &Arc<str> {
        &self.label
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.condition, self.policy)
    }
}

/// Ordered rule list
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and parse a rule file
    ///
    /// # Errors
    ///
    /// `RuleError::Io` if unreadable, `RuleError::Syntax` with the line
    /// number on a malformed entry.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let list = Self::parse(&text, path)?;
        debug!(
            path = %path.display(),
            rules = list.len(),
            address_rules = list.rules.iter().filter(|r| r.condition.requires_address()).count(),
            "Loaded rule list"
        );
        Ok(list)
    }

    /// Parse rule text; `origin` is only used in error messages
    ///
    /// # Errors
    ///
    /// `RuleError::Syntax` on a malformed line.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, RuleError> {
        let mut list = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let [condition, policy] = tokens.as_slice() else {
                return Err(RuleError::syntax(
                    origin,
                    line_no,
                    format!("expected '<type>:<value> <policy>', found '{line}'"),
                ));
            };
            let condition =
                Condition::parse(condition).map_err(|reason| RuleError::syntax(origin, line_no, reason))?;
            list.push(Rule::new(condition, Policy::parse(policy)));
        }
        Ok(list)
    }

    /// Append a rule (lowest precedence so far)
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Rules in precedence order
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether any rule needs answer addresses
    #[must_use]
    pub fn has_address_rules(&self) -> bool {
        self.rules.iter().any(|r| r.condition.requires_address())
    }

    /// Category tags referenced by the list
    #[must_use]
    pub fn categories(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter_map(|r| match &r.condition {
                Condition::Category(tag) => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    /// Region codes referenced by the list
    #[must_use]
    pub fn regions(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter_map(|r| match &r.condition {
                Condition::Region(code) => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<Rule> for RuleList {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

fn normalize(value: &str) -> String {
    crate::geo::normalize_name(value.trim_start_matches('.')).into_owned()
}

/// Accepts `a.b.c.d/len`, `::/len`, or a bare address (host route)
fn parse_cidr(value: &str) -> Result<IpNet, String> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let addr = value
        .parse::<IpAddr>()
        .map_err(|_| format!("invalid CIDR '{value}'"))?;
    let host_len = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, host_len).map_err(|e| format!("invalid CIDR '{value}': {e}"))
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}

fn is_subdomain_of(name: &str, domain: &str) -> bool {
    name == domain
        || (name.len() > domain.len()
            && name.ends_with(domain)
            && name.as_bytes()[name.len() - domain.len() - 1] == b'.')
}
