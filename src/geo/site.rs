//! Site category table: category tag to domain matchers
//!
//! Each category compiles its entries into four structures, one per
//! matcher type:
//!
//! - **Full** (exact name): hash lookup
//! - **Domain** (name and all subdomains): hash lookup per label suffix
//! - **Plain** (keyword): one Aho-Corasick pass
//! - **Regex**: one `RegexSet` pass
//!
//! The type decides how an entry matches, not its priority. A name is in
//! a category if any entry of any type matches it.
//!
//! # Example
//!
//! ```
//! use doh_autoproxy::geo::SiteMatcher;
//!
//! let matcher = SiteMatcher::builder("streaming")
//!     .add_domain("netflix.com")
//!     .add_full("www.hulu.com")
//!     .add_keyword("spotify")
//!     .add_regex(r"^video\d+\.example\.net$")
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! assert!(matcher.is_match("api.netflix.com"));
//! assert!(matcher.is_match("www.hulu.com"));
//! assert!(!matcher.is_match("hulu.com"));
//! assert!(matcher.is_match("open.spotifycdn.com"));
//! assert!(matcher.is_match("video12.example.net"));
//! ```

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use aho_corasick::AhoCorasick;
use regex::RegexSet;

use super::error::GeoError;

/// Lower-case a query name and strip the root dot, borrowing when possible
pub(crate) fn normalize_name(name: &str) -> Cow<'_, str> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    }
}

/// Compiled matchers of one category
pub struct SiteMatcher {
    full: HashSet<Box<str>>,
    domains: HashSet<Box<str>>,
    keywords: Option<AhoCorasick>,
    keyword_count: usize,
    regexes: Option<RegexSet>,
}

impl fmt::Debug for SiteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteMatcher")
            .field("full", &self.full.len())
            .field("domains", &self.domains.len())
            .field("keywords", &self.keyword_count)
            .field("regexes", &self.regexes.as_ref().map_or(0, RegexSet::len))
            .finish()
    }
}

impl SiteMatcher {
    /// Create a builder; `tag` is only used in error messages
    #[must_use]
    pub fn builder(tag: impl Into<String>) -> SiteMatcherBuilder {
        SiteMatcherBuilder::new(tag)
    }

    /// A category with no entries
    #[must_use]
    pub fn empty() -> Self {
        Self {
            full: HashSet::new(),
            domains: HashSet::new(),
            keywords: None,
            keyword_count: 0,
            regexes: None,
        }
    }

    /// Check a name against every entry of the category
    ///
    /// Case and a trailing root dot are ignored.
    #[must_use]
    pub fn is_match(&self, name: &str) -> bool {
        let name = normalize_name(name);
        self.is_match_normalized(&name)
    }

    pub(crate) fn is_match_normalized(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if self.full.contains(name) || self.match_domain(name) {
            return true;
        }
        if let Some(keywords) = &self.keywords {
            if keywords.is_match(name) {
                return true;
            }
        }
        self.regexes.as_ref().is_some_and(|set| set.is_match(name))
    }

    /// Walk the name and each parent at a label boundary
    fn match_domain(&self, name: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }
        let mut candidate = name;
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.find('.') {
                Some(dot) => candidate = &candidate[dot + 1..],
                None => return false,
            }
        }
    }

    /// Total number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.full.len()
            + self.domains.len()
            + self.keyword_count
            + self.regexes.as_ref().map_or(0, RegexSet::len)
    }

    /// Whether the category has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builder for [`SiteMatcher`]
#[derive(Debug)]
pub struct SiteMatcherBuilder {
    tag: String,
    full: Vec<String>,
    domains: Vec<String>,
    keywords: Vec<String>,
    regexes: Vec<String>,
}

impl SiteMatcherBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            full: Vec::new(),
            domains: Vec::new(),
            keywords: Vec::new(),
            regexes: Vec::new(),
        }
    }

    /// Add an exact-name entry
    #[must_use]
    pub fn add_full(mut self, name: &str) -> Self {
        self.push_full(name);
        self
    }

    /// Add a domain-and-subdomains entry
    #[must_use]
    pub fn add_domain(mut self, domain: &str) -> Self {
        self.push_domain(domain);
        self
    }

    /// Add a substring entry
    #[must_use]
    pub fn add_keyword(mut self, keyword: &str) -> Self {
        self.push_keyword(keyword);
        self
    }

    /// Add a regex entry
    ///
    /// # Errors
    ///
    /// Returns `GeoError::InvalidPattern` if the pattern does not compile.
    pub fn add_regex(mut self, pattern: &str) -> Result<Self, GeoError> {
        self.push_regex(pattern)?;
        Ok(self)
    }

    pub(crate) fn push_full(&mut self, name: &str) {
        let name = normalize_name(name.trim_start_matches('.'));
        if !name.is_empty() {
            self.full.push(name.into_owned());
        }
    }

    pub(crate) fn push_domain(&mut self, domain: &str) {
        let domain = normalize_name(domain.trim_start_matches('.'));
        if !domain.is_empty() {
            self.domains.push(domain.into_owned());
        }
    }

    pub(crate) fn push_keyword(&mut self, keyword: &str) {
        if !keyword.is_empty() {
            self.keywords.push(keyword.to_ascii_lowercase());
        }
    }

    pub(crate) fn push_regex(&mut self, pattern: &str) -> Result<(), GeoError> {
        // Validate individually so the error names the offending pattern
        regex::Regex::new(pattern).map_err(|e| GeoError::InvalidPattern {
            tag: self.tag.clone(),
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.regexes.push(pattern.to_string());
        Ok(())
    }

    /// Compile the category
    ///
    /// # Errors
    ///
    /// Returns `GeoError::InvalidPattern` if the keyword automaton or the
    /// regex set cannot be built.
    pub fn build(self) -> Result<SiteMatcher, GeoError> {
        let keyword_count = self.keywords.len();
        let keywords = if self.keywords.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&self.keywords)
                    .map_err(|e| GeoError::InvalidPattern {
                        tag: self.tag.clone(),
                        pattern: "<keywords>".to_string(),
                        reason: e.to_string(),
                    })?,
            )
        };

        let regexes = if self.regexes.is_empty() {
            None
        } else {
            Some(RegexSet::new(&self.regexes).map_err(|e| GeoError::InvalidPattern {
                tag: self.tag.clone(),
                pattern: "<regex set>".to_string(),
                reason: e.to_string(),
            })?)
        };

        Ok(SiteMatcher {
            full: self.full.into_iter().map(String::into_boxed_str).collect(),
            domains: self.domains.into_iter().map(String::into_boxed_str).collect(),
            keywords,
            keyword_count,
            regexes,
        })
    }
}

/// All loaded categories, keyed by lower-case tag
#[derive(Debug, Default)]
pub struct SiteCategoryTable {
    categories: HashMap<String, SiteMatcher>,
}

impl SiteCategoryTable {
    /// An empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a category
    pub fn insert(&mut self, tag: &str, matcher: SiteMatcher) {
        self.categories.insert(tag.to_ascii_lowercase(), matcher);
    }

    /// Check whether `name` belongs to category `tag`
    ///
    /// Unknown tags never match.
    #[must_use]
    pub fn matches(&self, name: &str, tag: &str) -> bool {
        let tag = normalize_name(tag);
        match self.categories.get(tag.as_ref()) {
            Some(matcher) => matcher.is_match(name),
            None => false,
        }
    }

    /// Get a compiled category
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&SiteMatcher> {
        self.categories.get(normalize_name(tag).as_ref())
    }

    /// Whether a category is loaded
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    /// Number of loaded categories
    #[must_use]
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    /// Whether no category is loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Iterate over loaded tags
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Matcher Type Tests
    // ========================================================================

    #[test]
    fn test_full_match_is_exact() {
        let m = SiteMatcher::builder("t").add_full("example.com").build().unwrap();
        assert!(m.is_match("example.com"));
        assert!(m.is_match("EXAMPLE.COM."));
        assert!(!m.is_match("www.example.com"));
        assert!(!m.is_match("example.co"));
    }

    #[test]
    fn test_domain_match_covers_subdomains_on_label_boundary() {
        let m = SiteMatcher::builder("t").add_domain("google.com").build().unwrap();
        assert!(m.is_match("google.com"));
        assert!(m.is_match("mail.google.com"));
        assert!(m.is_match("a.b.c.google.com"));
        assert!(!m.is_match("notgoogle.com"));
        assert!(!m.is_match("google.com.evil.net"));
    }

    #[test]
    fn test_keyword_match_is_substring() {
        let m = SiteMatcher::builder("t").add_keyword("Tracker").build().unwrap();
        assert!(m.is_match("tracker.example.org"));
        assert!(m.is_match("adtrackers.net"));
        assert!(!m.is_match("example.org"));
    }

    #[test]
    fn test_regex_match() {
        let m = SiteMatcher::builder("t")
            .add_regex(r"^ad[0-9]+\.")
            .unwrap()
            .build()
            .unwrap();
        assert!(m.is_match("ad123.cdn.net"));
        assert!(!m.is_match("bad1.cdn.net"));
    }

    #[test]
    fn test_invalid_regex_names_pattern() {
        let err = SiteMatcher::builder("cat").add_regex("(unclosed").unwrap_err();
        match err {
            GeoError::InvalidPattern { tag, pattern, .. } => {
                assert_eq!(tag, "cat");
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_any_type_hit_counts() {
        let m = SiteMatcher::builder("mixed")
            .add_full("exact.test")
            .add_domain("suffix.test")
            .add_keyword("kw")
            .add_regex(r"^re\.")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(m.len(), 4);
        for name in ["exact.test", "x.suffix.test", "mykw.org", "re.example"] {
            assert!(m.is_match(name), "{name} should match");
        }
        assert!(!m.is_match("other.test"));
    }

    #[test]
    fn test_empty_name_never_matches() {
        let m = SiteMatcher::builder("t").add_keyword("a").build().unwrap();
        assert!(!m.is_match(""));
        assert!(!m.is_match("."));
    }

    // ========================================================================
    // Table Tests
    // ========================================================================

    #[test]
    fn test_table_lookup_by_tag() {
        let mut table = SiteCategoryTable::new();
        table.insert(
            "Streaming",
            SiteMatcher::builder("streaming").add_domain("netflix.com").build().unwrap(),
        );

        assert!(table.contains("streaming"));
        assert!(table.matches("www.netflix.com", "STREAMING"));
        assert!(!table.matches("www.netflix.com", "social"));
        assert!(!table.matches("example.com", "streaming"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_normalize_name_borrows_lowercase() {
        assert!(matches!(normalize_name("example.com"), Cow::Borrowed("example.com")));
        assert_eq!(normalize_name("Example.COM.").as_ref(), "example.com");
    }
}
