//! Geo classification databases
//!
//! Two V2Ray-format containers back address and name classification:
//!
//! - `geoip.dat` maps CIDR blocks to region codes, answered with a
//!   longest-prefix match ([`RegionTable`])
//! - `geosite.dat` maps category tags to name matchers ([`SiteCategoryTable`])
//!
//! [`GeoStore`] owns both tables. It is immutable once loaded; reloads build
//! a fresh store and swap it in whole.
//!
//! # Example
//!
//! ```no_run
//! use doh_autoproxy::geo::GeoStoreLoader;
//!
//! let store = GeoStoreLoader::new()
//!     .with_categories(["cn", "ads"])
//!     .load("geoip.dat", "geosite.dat")?;
//! assert!(store.matches_category("www.baidu.com", "cn"));
//! # Ok::<(), doh_autoproxy::geo::GeoError>(())
//! ```

mod dat;
mod error;
pub mod fetch;
mod region;
mod site;
mod store;

pub use dat::{Cidr, Domain, DomainAttribute, DomainType, GeoIp, GeoIpList, GeoSite, GeoSiteList};
pub use error::GeoError;
pub use fetch::{download_file, ensure_geo_file, should_download, GeoKind, Provision};
pub use region::{RegionTable, RegionTableBuilder};
pub use site::{SiteCategoryTable, SiteMatcher, SiteMatcherBuilder};
pub use store::{normalize_query_name, GeoStore, GeoStoreLoader};

pub(crate) use site::normalize_name;
