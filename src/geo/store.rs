//! Geo database store: the immutable region + category snapshot
//!
//! [`GeoStore::load`] decodes both containers and indexes every entry.
//! [`GeoStoreLoader`] can restrict loading to the region codes and
//! category tags a rule list actually references. Ranges of other regions
//! are still indexed, without a code, so a lookup never falls through to
//! a shorter range of a loaded region.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::dat::{self, DomainType, GeoSite};
use super::error::GeoError;
use super::region::RegionTable;
use super::site::{normalize_name, SiteCategoryTable, SiteMatcher, SiteMatcherBuilder};

/// Immutable snapshot of both geo databases
#[derive(Debug, Default)]
pub struct GeoStore {
    regions: RegionTable,
    sites: SiteCategoryTable,
}

impl GeoStore {
    /// Load every region and every category from the two database files
    ///
    /// # Errors
    ///
    /// - `GeoError::MissingFile` if a file is absent or zero length
    /// - `GeoError::CorruptDatabase` if a container cannot be decoded
    pub fn load(ip_path: impl AsRef<Path>, site_path: impl AsRef<Path>) -> Result<Self, GeoError> {
        GeoStoreLoader::new().load(ip_path, site_path)
    }

    /// Assemble a store from prebuilt tables
    #[must_use]
    pub fn from_tables(regions: RegionTable, sites: SiteCategoryTable) -> Self {
        Self { regions, sites }
    }

    /// Region code of the longest matching range containing `addr`
    #[must_use]
    pub fn resolve_region(&self, addr: IpAddr) -> Option<&str> {
        self.regions.resolve(addr)
    }

    /// Whether `name` belongs to category `tag`
    #[must_use]
    pub fn matches_category(&self, name: &str, tag: &str) -> bool {
        self.sites.matches(name, tag)
    }

    /// The region table
    #[must_use]
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// The category table
    #[must_use]
    pub fn sites(&self) -> &SiteCategoryTable {
        &self.sites
    }
}

/// Loader with optional region/category filters
///
/// Category tags may carry an attribute filter (`geolocation-cn@ads`):
/// only entries with every listed attribute are kept, compiled under the
/// full tag.
#[derive(Debug, Default, Clone)]
pub struct GeoStoreLoader {
    regions: Option<HashSet<String>>,
    categories: Option<HashSet<String>>,
}

impl GeoStoreLoader {
    /// A loader that keeps everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only materialise these region codes
    #[must_use]
    pub fn with_regions<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.regions = Some(
            codes
                .into_iter()
                .map(|c| c.as_ref().to_ascii_uppercase())
                .collect(),
        );
        self
    }

    /// Only compile these category tags
    #[must_use]
    pub fn with_categories<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.categories = Some(
            tags.into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Load both databases
    ///
    /// # Errors
    ///
    /// See [`GeoStore::load`].
    pub fn load(
        &self,
        ip_path: impl AsRef<Path>,
        site_path: impl AsRef<Path>,
    ) -> Result<GeoStore, GeoError> {
        let regions = self.load_regions(ip_path.as_ref())?;
        let sites = self.load_sites(site_path.as_ref())?;
        Ok(GeoStore { regions, sites })
    }

    /// Decode `geoip.dat` into a region table
    ///
    /// # Errors
    ///
    /// `MissingFile` or `CorruptDatabase`.
    pub fn load_regions(&self, path: &Path) -> Result<RegionTable, GeoError> {
        let start = Instant::now();
        let bytes = dat::read_container(path)?;
        let list = dat::decode_geoip(path, &bytes)?;

        let mut builder = RegionTable::builder();
        let mut skipped = 0usize;
        for entry in &list.entry {
            let code = entry.country_code.to_ascii_uppercase();
            if entry.reverse_match {
                warn!(region = %code, "Skipping reverse-match region entry");
                continue;
            }
            // Unwanted regions keep their ranges so longer prefixes still win
            let wanted = self.regions.as_ref().map_or(true, |w| w.contains(&code));
            let label = wanted.then_some(code.as_str());
            for cidr in &entry.cidr {
                if !builder.insert_raw(&cidr.ip, cidr.prefix, label) {
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Skipped invalid CIDR entries");
        }
        let table = builder.build();
        info!(
            path = %path.display(),
            ranges = table.len(),
            regions = table.region_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded region table"
        );
        Ok(table)
    }

    /// Decode `geosite.dat` into a category table
    ///
    /// # Errors
    ///
    /// `MissingFile` or `CorruptDatabase`.
    pub fn load_sites(&self, path: &Path) -> Result<SiteCategoryTable, GeoError> {
        let start = Instant::now();
        let bytes = dat::read_container(path)?;
        let list = dat::decode_geosite(path, &bytes)?;

        let mut table = SiteCategoryTable::new();
        match &self.categories {
            None => {
                for site in &list.entry {
                    let tag = site.country_code.to_ascii_lowercase();
                    table.insert(&tag, compile_site(&tag, site, &[]));
                }
            }
            Some(wanted) => {
                for requested in wanted {
                    let mut parts = requested.split('@');
                    let base = parts.next().unwrap_or_default();
                    let attrs: Vec<&str> = parts.filter(|a| !a.is_empty()).collect();
                    match list
                        .entry
                        .iter()
                        .find(|s| s.country_code.eq_ignore_ascii_case(base))
                    {
                        Some(site) => table.insert(requested, compile_site(requested, site, &attrs)),
                        None => warn!(tag = %requested, "Category not found in site database"),
                    }
                }
            }
        }

        info!(
            path = %path.display(),
            categories = table.len(),
            available = list.entry.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded site category table"
        );
        Ok(table)
    }
}

/// Compile one category, dropping entries that fail to compile
fn compile_site(tag: &str, site: &GeoSite, attrs: &[&str]) -> SiteMatcher {
    let mut builder = SiteMatcherBuilder::new(tag);
    for domain in &site.domain {
        if !attrs.iter().all(|a| domain.has_attribute(a)) {
            continue;
        }
        match domain.r#type() {
            DomainType::Full => builder.push_full(&domain.value),
            DomainType::Domain => builder.push_domain(&domain.value),
            DomainType::Plain => builder.push_keyword(&domain.value),
            DomainType::Regex => {
                if let Err(e) = builder.push_regex(&domain.value) {
                    warn!(error = %e, "Dropping site entry");
                }
            }
        }
    }
    match builder.build() {
        Ok(matcher) => {
            debug!(tag, entries = matcher.len(), "Compiled category");
            matcher
        }
        Err(e) => {
            warn!(tag, error = %e, "Category failed to compile, treating as empty");
            SiteMatcher::empty()
        }
    }
}

/// Normalise a name the same way category lookups do
#[must_use]
pub fn normalize_query_name(name: &str) -> String {
    normalize_name(name).into_owned()
}
