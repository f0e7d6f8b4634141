//! Region table: longest-prefix match from IP address to region code
//!
//! The table is a pair of binary tries, one per address family. Each
//! inserted CIDR marks the node at depth `prefix_len`; a lookup walks the
//! address bits and remembers the deepest marked node it passes.
//!
//! Inserting the same prefix twice overwrites the earlier mark, so when
//! two equal-length ranges cover an address the entry inserted later wins.
//! Database order is therefore authoritative.
//!
//! # Example
//!
//! ```
//! use doh_autoproxy::geo::RegionTable;
//! use std::net::IpAddr;
//!
//! let mut builder = RegionTable::builder();
//! builder.insert("10.0.0.0/8".parse().unwrap(), "PRIVATE");
//! builder.insert("10.1.0.0/16".parse().unwrap(), "LAB");
//! let table = builder.build();
//!
//! let ip: IpAddr = "10.1.2.3".parse().unwrap();
//! assert_eq!(table.resolve(ip), Some("LAB"));
//! let ip: IpAddr = "10.2.0.1".parse().unwrap();
//! assert_eq!(table.resolve(ip), Some("PRIVATE"));
//! ```

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

/// Sentinel for "no child" / "no region" in the packed trie nodes
const NONE: u32 = u32::MAX;

/// Marks a range whose region was not loaded. It still shadows shorter
/// prefixes but resolves to no region.
const UNLISTED: u32 = u32::MAX - 1;

#[derive(Debug, Clone, Copy)]
struct Node {
    children: [u32; 2],
    region: u32,
}

impl Node {
    const fn empty() -> Self {
        Self {
            children: [NONE, NONE],
            region: NONE,
        }
    }
}

/// Binary trie over the leading `width` bits of a `u128`
#[derive(Debug, Clone)]
struct BitTrie {
    width: u32,
    nodes: Vec<Node>,
}

impl BitTrie {
    fn new(width: u32) -> Self {
        Self {
            width,
            nodes: vec![Node::empty()],
        }
    }

    #[inline]
    fn bit(&self, bits: u128, depth: u32) -> usize {
        ((bits >> (self.width - 1 - depth)) & 1) as usize
    }

    fn insert(&mut self, bits: u128, prefix_len: u32, region: u32) {
        let mut idx = 0usize;
        for depth in 0..prefix_len.min(self.width) {
            let bit = self.bit(bits, depth);
            let child = self.nodes[idx].children[bit];
            idx = if child == NONE {
                let next = self.nodes.len();
                self.nodes.push(Node::empty());
                // Node count is bounded by entries * 128, far below u32::MAX
                self.nodes[idx].children[bit] = next as u32;
                next
            } else {
                child as usize
            };
        }
        self.nodes[idx].region = region;
    }

    fn lookup(&self, bits: u128) -> Option<u32> {
        let mut idx = 0usize;
        let mut best = self.nodes[0].region;
        for depth in 0..self.width {
            let child = self.nodes[idx].children[self.bit(bits, depth)];
            if child == NONE {
                break;
            }
            idx = child as usize;
            if self.nodes[idx].region != NONE {
                best = self.nodes[idx].region;
            }
        }
        (best != NONE).then_some(best)
    }
}

/// Longest-prefix-match table from address to region code
///
/// Region codes are stored upper-case. IPv4-mapped IPv6 addresses
/// (`::ffff:a.b.c.d`) are looked up in the IPv4 trie.
#[derive(Debug, Clone)]
pub struct RegionTable {
    v4: BitTrie,
    v6: BitTrie,
    codes: Vec<Box<str>>,
    entries: usize,
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl RegionTable {
    /// Create a builder
    #[must_use]
    pub fn builder() -> RegionTableBuilder {
        RegionTableBuilder::new()
    }

    /// An empty table that resolves nothing
    #[must_use]
    pub fn empty() -> Self {
        Self {
            v4: BitTrie::new(32),
            v6: BitTrie::new(128),
            codes: Vec::new(),
            entries: 0,
        }
    }

    /// Resolve an address to the region of its longest matching range
    #[must_use]
    pub fn resolve(&self, addr: IpAddr) -> Option<&str> {
        let idx = match addr {
            IpAddr::V4(v4) => self.v4.lookup(u128::from(u32::from(v4))),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.v4.lookup(u128::from(u32::from(v4))),
                None => self.v6.lookup(u128::from(v6)),
            },
        }?;
        if idx == UNLISTED {
            return None;
        }
        self.codes.get(idx as usize).map(AsRef::as_ref)
    }

    /// Check whether `addr` resolves to `code` (case-insensitive)
    #[must_use]
    pub fn contains(&self, addr: IpAddr, code: &str) -> bool {
        self.resolve(addr)
            .is_some_and(|region| region.eq_ignore_ascii_case(code))
    }

    /// Number of CIDR ranges inserted
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the table has no ranges
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Distinct region codes present in the table
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.codes.len()
    }
}

/// Builder for [`RegionTable`]
///
/// Entries must be inserted in database order.
#[derive(Debug)]
pub struct RegionTableBuilder {
    table: RegionTable,
    code_index: HashMap<String, u32>,
}

impl Default for RegionTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTableBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: RegionTable::empty(),
            code_index: HashMap::new(),
        }
    }

    fn intern(&mut self, code: &str) -> u32 {
        let code = code.to_ascii_uppercase();
        if let Some(&idx) = self.code_index.get(&code) {
            return idx;
        }
        let idx = self.table.codes.len() as u32;
        self.table.codes.push(code.clone().into_boxed_str());
        self.code_index.insert(code, idx);
        idx
    }

    /// Insert a range; a later insert of the same prefix replaces the earlier one
    pub fn insert(&mut self, net: IpNet, code: &str) -> &mut Self {
        let region = self.intern(code);
        self.insert_index(net, region);
        self
    }

    /// Insert a range of a region that is not materialised
    ///
    /// Addresses whose longest match is this range resolve to `None`
    /// instead of falling through to a shorter range of another region.
    pub fn insert_unlisted(&mut self, net: IpNet) -> &mut Self {
        self.insert_index(net, UNLISTED);
        self
    }

    fn insert_index(&mut self, net: IpNet, region: u32) {
        match net.trunc() {
            IpNet::V4(v4) => self.table.v4.insert(
                u128::from(u32::from(v4.network())),
                u32::from(v4.prefix_len()),
                region,
            ),
            IpNet::V6(v6) => self.table.v6.insert(
                u128::from(v6.network()),
                u32::from(v6.prefix_len()),
                region,
            ),
        }
        self.table.entries += 1;
    }

    /// Insert a range from raw database bytes (4 or 16 address bytes)
    ///
    /// `None` for `code` inserts the range as unlisted. Returns `false` if
    /// the bytes or prefix length are invalid.
    pub fn insert_raw(&mut self, ip: &[u8], prefix: u32, code: Option<&str>) -> bool {
        let net = match ip.len() {
            4 => {
                let octets: [u8; 4] = [ip[0], ip[1], ip[2], ip[3]];
                u8::try_from(prefix)
                    .ok()
                    .and_then(|p| ipnet::Ipv4Net::new(octets.into(), p).ok())
                    .map(IpNet::V4)
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                u8::try_from(prefix)
                    .ok()
                    .and_then(|p| ipnet::Ipv6Net::new(octets.into(), p).ok())
                    .map(IpNet::V6)
            }
            _ => None,
        };
        match (net, code) {
            (Some(net), Some(code)) => {
                self.insert(net, code);
                true
            }
            (Some(net), None) => {
                self.insert_unlisted(net);
                true
            }
            (None, _) => false,
        }
    }

    /// Number of ranges inserted so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.entries
    }

    /// Whether nothing has been inserted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.entries == 0
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> RegionTable {
        self.table
    }
}
