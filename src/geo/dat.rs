//! Protobuf containers used by `geoip.dat` and `geosite.dat`
//!
//! These are the message layouts distributed by the V2Ray/Xray projects
//! (`common/geodata`). They are declared with `prost` derives so no build
//! script or `protoc` is needed.

use std::path::Path;

use prost::Message;

use super::error::GeoError;

/// One CIDR block: raw network address bytes plus prefix length
#[derive(Clone, PartialEq, Message)]
pub struct Cidr {
    /// 4 bytes for IPv4, 16 for IPv6
    #[prost(bytes = "vec", tag = "1")]
    pub ip: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub prefix: u32,
}

/// All CIDR blocks of one region code
#[derive(Clone, PartialEq, Message)]
pub struct GeoIp {
    #[prost(string, tag = "1")]
    pub country_code: String,
    #[prost(message, repeated, tag = "2")]
    pub cidr: Vec<Cidr>,
    #[prost(bool, tag = "3")]
    pub reverse_match: bool,
}

/// Top-level message of `geoip.dat`
#[derive(Clone, PartialEq, Message)]
pub struct GeoIpList {
    #[prost(message, repeated, tag = "1")]
    pub entry: Vec<GeoIp>,
}

/// Matcher type of a site entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DomainType {
    /// Substring match
    Plain = 0,
    /// Regular expression
    Regex = 1,
    /// Domain and all of its subdomains
    Domain = 2,
    /// Exact name
    Full = 3,
}

/// Attribute value attached to a site entry (`@cn`, `@ads`, ...)
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum AttributeValue {
    #[prost(bool, tag = "2")]
    BoolValue(bool),
    #[prost(int64, tag = "3")]
    IntValue(i64),
}

#[derive(Clone, PartialEq, Message)]
pub struct DomainAttribute {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "AttributeValue", tags = "2, 3")]
    pub typed_value: Option<AttributeValue>,
}

/// One site matcher
#[derive(Clone, PartialEq, Message)]
pub struct Domain {
    #[prost(enumeration = "DomainType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(message, repeated, tag = "3")]
    pub attribute: Vec<DomainAttribute>,
}

impl Domain {
    /// Whether this entry carries the attribute `key`
    #[must_use]
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attribute.iter().any(|a| a.key.eq_ignore_ascii_case(key))
    }
}

/// All matchers of one category tag
#[derive(Clone, PartialEq, Message)]
pub struct GeoSite {
    #[prost(string, tag = "1")]
    pub country_code: String,
    #[prost(message, repeated, tag = "2")]
    pub domain: Vec<Domain>,
}

/// Top-level message of `geosite.dat`
#[derive(Clone, PartialEq, Message)]
pub struct GeoSiteList {
    #[prost(message, repeated, tag = "1")]
    pub entry: Vec<GeoSite>,
}

/// Read a container file, mapping absent and zero-length files to `MissingFile`
pub(crate) fn read_container(path: &Path) -> Result<Vec<u8>, GeoError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GeoError::MissingFile {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(GeoError::io(path, e)),
    };
    if bytes.is_empty() {
        return Err(GeoError::MissingFile {
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

/// Decode `geoip.dat`
pub(crate) fn decode_geoip(path: &Path, bytes: &[u8]) -> Result<GeoIpList, GeoError> {
    let list = GeoIpList::decode(bytes).map_err(|e| GeoError::corrupt(path, e.to_string()))?;
    if list.entry.is_empty() {
        return Err(GeoError::corrupt(path, "container holds no entries"));
    }
    Ok(list)
}

/// Decode `geosite.dat`
pub(crate) fn decode_geosite(path: &Path, bytes: &[u8]) -> Result<GeoSiteList, GeoError> {
    let list = GeoSiteList::decode(bytes).map_err(|e| GeoError::corrupt(path, e.to_string()))?;
    if list.entry.is_empty() {
        return Err(GeoError::corrupt(path, "container holds no entries"));
    }
    Ok(list)
}
