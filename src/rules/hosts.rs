//! Override list (hosts file)
//!
//! One entry per line: `<name> <action>`. The action is one or more IP
//! addresses, `block`, `nxdomain`, or an upstream group name:
//!
//! ```text
//! # forced answers
//! router.lan        192.168.1.1
//! dual.lan          10.0.0.2 fd00::2
//! # terminal actions
//! blocked.example   block
//! gone.example      nxdomain
//! # forced policy
//! intranet.corp     office
//! ```
//!
//! Names match exactly (no subdomains), ignoring ASCII case and a trailing
//! root dot. A name listed twice keeps its last entry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::types::Policy;
use crate::error::RuleError;
use crate::geo::normalize_name;

/// Parsed override list
#[derive(Debug, Clone, Default)]
pub struct HostsTable {
    entries: HashMap<String, Policy>,
}

impl HostsTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and parse a hosts file
    ///
    /// # Errors
    ///
    /// `RuleError::Io` if the file cannot be read, `RuleError::Syntax` with
    /// the offending line otherwise.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(&text, path)?;
        debug!(path = %path.display(), entries = table.len(), "Loaded override list");
        Ok(table)
    }

    /// Parse hosts text; `origin` is only used in error messages
    ///
    /// # Errors
    ///
    /// `RuleError::Syntax` on a malformed line.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, RuleError> {
        let mut table = Self::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw);
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            let actions: Vec<&str> = tokens.collect();
            if actions.is_empty() {
                return Err(RuleError::syntax(origin, line_no, format!("'{name}' has no action")));
            }
            if name.parse::<IpAddr>().is_ok() {
                return Err(RuleError::syntax(
                    origin,
                    line_no,
                    format!("expected '<name> <action>', found address '{name}' in name position"),
                ));
            }

            let policy = parse_action(&actions).map_err(|reason| RuleError::syntax(origin, line_no, reason))?;
            table.insert(name, policy);
        }

        Ok(table)
    }

    /// Add or replace an entry
    pub fn insert(&mut self, name: &str, policy: Policy) {
        self.entries.insert(normalize_name(name).into_owned(), policy);
    }

    /// Exact lookup
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.entries.get(&*normalize_name(name))
    }

    /// Iterate over `(name, policy)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Policy)> {
        self.entries.iter().map(|(name, policy)| (name.as_str(), policy))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn strip_comment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(before, _)| before).trim()
}

fn parse_action(tokens: &[&str]) -> Result<Policy, String> {
    let addrs: Vec<IpAddr> = tokens.iter().filter_map(|t| t.parse().ok()).collect();
    if addrs.len() == tokens.len() {
        return Ok(Policy::Local(Arc::from(addrs)));
    }
    if !addrs.is_empty() {
        return Err(format!("cannot mix addresses and policies in '{}'", tokens.join(" ")));
    }
    match tokens {
        [single] => Ok(Policy::parse(single)),
        _ => Err(format!("expected a single policy, found '{}'", tokens.join(" "))),
    }
}
