//! # cidr-lookup
//!
//! Resolves an IP address to every registered CIDR block that contains it,
//! returning the metadata attached to each matching block.
//!
//! The core is [`CidrTrie`]: a binary trie keyed on address bits. Registered
//! prefixes push their records down onto the leaves they cover, and sibling
//! leaves that end up structurally identical are merged back together, so the
//! node count stays bounded by the number of distinct prefix boundaries
//! rather than growing per insertion.
//!
//! Queries return the union of records across *all* covering prefixes, not
//! just the longest match: range feeds like AWS's `ip-ranges.json`
//! legitimately register overlapping blocks under different tags for the same
//! address space, and callers want to see every match.
//!
//! ## Example
//!
//! ```rust
//! use cidr_lookup::{CidrTrie, IpVersion, parse_address, parse_cidr};
//!
//! let mut trie = CidrTrie::new(IpVersion::V4);
//! trie.insert(&parse_cidr(IpVersion::V4, "192.0.2.0/24").unwrap(), "corp");
//! trie.insert(&parse_cidr(IpVersion::V4, "192.0.2.0/26").unwrap(), "lab");
//!
//! let addr = parse_address(IpVersion::V4, "192.0.2.5").unwrap();
//! assert_eq!(trie.query(addr), ["corp", "lab"]);
//! assert_eq!(trie.query(parse_address(IpVersion::V4, "192.0.2.200").unwrap()), ["corp"]);
//! ```

#![forbid(unsafe_code)]

use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Address families
// =============================================================================

/// The fixed bit-width address space a trie instance is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Address width in bits: 32 for IPv4, 128 for IPv6.
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpVersion::V4 => "IPv4",
            IpVersion::V6 => "IPv6",
        })
    }
}

/// All-ones mask covering the low `bits` bits of a `u128`.
#[inline]
fn family_mask(bits: u32) -> u128 {
    if bits == 128 {
        !0
    } else {
        (1u128 << bits) - 1
    }
}

/// Bit of `address` selected at `depth`, counting from the most significant
/// bit of the family width. Callers guarantee `depth < bits`.
#[inline]
fn bit_at(address: u128, bits: u32, depth: u32) -> usize {
    ((address >> (bits - 1 - depth)) & 1) as usize
}

// =============================================================================
// Errors
// =============================================================================

/// Malformed address or CIDR text. Always recoverable: callers typically
/// treat it as "not an address literal" and fall through to name resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid {version} address `{text}`")]
    InvalidAddress { version: IpVersion, text: String },
    #[error("invalid {version} prefix length `{text}`")]
    InvalidPrefixLength { version: IpVersion, text: String },
}

/// Failure to load a bulk range document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("malformed range document: {0}")]
    Document(#[from] serde_json::Error),
    #[error(transparent)]
    Prefix(#[from] ParseError),
}

// =============================================================================
// Address codec
// =============================================================================

/// A CIDR prefix: an address plus a significant-bit count. The insignificant
/// low bits are zeroed on construction, so two spellings of the same block
/// compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    version: IpVersion,
    address: u128,
    len: u8,
}

impl Cidr {
    /// Builds a prefix from raw parts, masking the address to the family
    /// width and zeroing the host bits.
    ///
    /// Panics if `len` exceeds the family width; the codec never produces
    /// such a length, so hitting this is a caller bug.
    pub fn new(version: IpVersion, address: u128, len: u8) -> Self {
        let bits = version.bits();
        assert!(
            u32::from(len) <= bits,
            "prefix length {len} exceeds {version} width"
        );
        let host = bits - u32::from(len);
        let address = address & family_mask(bits);
        let address = if host >= 128 { 0 } else { (address >> host) << host };
        Self {
            version,
            address,
            len,
        }
    }

    #[inline]
    pub fn version(&self) -> IpVersion {
        self.version
    }

    #[inline]
    pub fn address(&self) -> u128 {
        self.address
    }

    #[inline]
    pub fn len(&self) -> u8 {
        self.len
    }

    /// True for the zero-length prefix, which covers the whole family.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `address` shares this prefix's top `len` bits.
    #[inline]
    pub fn contains(&self, address: u128) -> bool {
        let host = self.version.bits() - u32::from(self.len);
        if host >= 128 {
            return true;
        }
        (address & family_mask(self.version.bits())) >> host == self.address >> host
    }
}

fn parse_octet(part: &str) -> Option<u32> {
    if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // The decimal-dotted grammar has no leading zeros.
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    let value: u32 = part.parse().ok()?;
    (value <= 255).then_some(value)
}

fn parse_v4(text: &str) -> Option<u128> {
    let mut value: u32 = 0;
    let mut count = 0usize;
    for part in text.split('.') {
        count += 1;
        if count > 4 {
            return None;
        }
        value = (value << 8) | parse_octet(part)?;
    }
    if count != 4 {
        return None;
    }
    Some(u128::from(value))
}

fn parse_group(group: &str) -> Option<u16> {
    if group.is_empty() || group.len() > 4 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(group, 16).ok()
}

/// Parses one side of a `::` elision; an empty side contributes no groups.
fn parse_group_list(part: &str) -> Option<Vec<u16>> {
    if part.is_empty() {
        return Some(Vec::new());
    }
    part.split(':').map(parse_group).collect()
}

fn parse_v6(text: &str) -> Option<u128> {
    if text.is_empty() {
        return None;
    }

    let mut groups = [0u16; 8];
    match text.split_once("::") {
        None => {
            let mut count = 0usize;
            for group in text.split(':') {
                if count == 8 {
                    return None;
                }
                groups[count] = parse_group(group)?;
                count += 1;
            }
            if count != 8 {
                return None;
            }
        }
        Some((head, tail)) => {
            // A second `::` (or a stray extra `:`) leaves an empty group on
            // the tail side, which `parse_group` rejects.
            let head = parse_group_list(head)?;
            let tail = parse_group_list(tail)?;
            // The elision must stand in for at least one zero group.
            if head.len() + tail.len() > 7 {
                return None;
            }
            groups[..head.len()].copy_from_slice(&head);
            groups[8 - tail.len()..].copy_from_slice(&tail);
        }
    }

    Some(
        groups
            .iter()
            .fold(0u128, |acc, &g| (acc << 16) | u128::from(g)),
    )
}

/// Parses a literal address of the given family into its integer form
/// (low `bits()` bits of the returned `u128`).
pub fn parse_address(version: IpVersion, text: &str) -> Result<u128, ParseError> {
    let parsed = match version {
        IpVersion::V4 => parse_v4(text),
        IpVersion::V6 => parse_v6(text),
    };
    parsed.ok_or_else(|| ParseError::InvalidAddress {
        version,
        text: text.to_owned(),
    })
}

fn parse_prefix_len(version: IpVersion, text: &str) -> Option<u8> {
    if text.is_empty() || text.len() > 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u32 = text.parse().ok()?;
    (value <= version.bits()).then_some(value as u8)
}

/// Parses CIDR notation. The `/len` suffix is optional and defaults to the
/// full family width (an exact single-address match).
pub fn parse_cidr(version: IpVersion, text: &str) -> Result<Cidr, ParseError> {
    let (address_text, len) = match text.split_once('/') {
        None => (text, version.bits() as u8),
        Some((address_text, len_text)) => {
            let len = parse_prefix_len(version, len_text).ok_or_else(|| {
                ParseError::InvalidPrefixLength {
                    version,
                    text: len_text.to_owned(),
                }
            })?;
            (address_text, len)
        }
    };
    let address = parse_address(version, address_text)?;
    Ok(Cidr::new(version, address, len))
}

/// Classifies `text` as a literal address of exactly one family, or `None`
/// ("neither", the cue for callers to fall back to hostname resolution).
pub fn detect_version(text: &str) -> Option<IpVersion> {
    if parse_v4(text).is_some() {
        Some(IpVersion::V4)
    } else if parse_v6(text).is_some() {
        Some(IpVersion::V6)
    } else {
        None
    }
}

// =============================================================================
// Prefix trie
// =============================================================================

/// A subtree reachable by a specific bit path from the root. Exactly two
/// states: a leaf (coverage flag + record set) or an interior node (two
/// children, nothing else). Each node is exclusively owned by its single
/// parent; splits and merges move nodes, never alias them.
enum Node<R> {
    Leaf {
        /// Whether some registered prefix covers this entire subtree.
        /// `false` implies `records` is empty.
        covered: bool,
        /// Sorted, deduplicated. Kept canonical so sibling equality (the
        /// compaction test) is plain structural equality.
        records: Vec<R>,
    },
    Interior {
        /// Children for bit values 0 and 1, in that order.
        children: [Box<Node<R>>; 2],
    },
}

impl<R: Clone + Ord> Node<R> {
    fn empty_leaf() -> Self {
        Node::Leaf {
            covered: false,
            records: Vec::new(),
        }
    }

    /// Converts a leaf into an interior node whose two children are copies
    /// of the original, so the split never changes query results.
    fn split(&mut self) {
        let Node::Leaf { covered, records } = mem::replace(self, Node::empty_leaf()) else {
            unreachable!("only leaves are split");
        };
        let zero = Node::Leaf {
            covered,
            records: records.clone(),
        };
        let one = Node::Leaf { covered, records };
        *self = Node::Interior {
            children: [Box::new(zero), Box::new(one)],
        };
    }

    /// Marks every leaf of this subtree as covered and carrying `record`,
    /// merging leaves that become identical along the way.
    fn cover(&mut self, record: &R) {
        match self {
            Node::Leaf { covered, records } => {
                *covered = true;
                if let Err(at) = records.binary_search(record) {
                    records.insert(at, record.clone());
                }
            }
            Node::Interior { children } => {
                children[0].cover(record);
                children[1].cover(record);
            }
        }
        self.collapse_equal_leaves();
    }

    /// Compaction: an interior node whose children are leaves with the same
    /// coverage flag and the same record set is replaced by one such leaf.
    fn collapse_equal_leaves(&mut self) {
        let mergeable = match self {
            Node::Interior { children } => matches!(
                (children[0].as_ref(), children[1].as_ref()),
                (
                    Node::Leaf { covered: c0, records: r0 },
                    Node::Leaf { covered: c1, records: r1 },
                ) if c0 == c1 && r0 == r1
            ),
            Node::Leaf { .. } => false,
        };
        if mergeable {
            let Node::Interior { children } = mem::replace(self, Node::empty_leaf()) else {
                unreachable!("mergeable node must be interior");
            };
            let [keep, _] = children;
            *self = *keep;
        }
    }

    fn insert(&mut self, prefix: &Cidr, record: &R, depth: u32) {
        if depth == u32::from(prefix.len()) {
            self.cover(record);
            return;
        }
        if let Node::Leaf { .. } = self {
            self.split();
        }
        let bit = bit_at(prefix.address(), prefix.version().bits(), depth);
        match self {
            Node::Interior { children } => children[bit].insert(prefix, record, depth + 1),
            Node::Leaf { .. } => unreachable!("leaf was split before descending"),
        }
        self.collapse_equal_leaves();
    }

    fn count(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Interior { children } => 1 + children[0].count() + children[1].count(),
        }
    }
}

/// Binary trie mapping CIDR prefixes to record sets, bound to one address
/// family for its lifetime. Only grows; there is no removal.
///
/// `query` returns the union of records across every registered prefix
/// covering the address. Splitting pushes records down into both halves and
/// covering writes into every leaf of the covered subtree, so the leaf a
/// query terminates at always carries that full union.
pub struct CidrTrie<R> {
    version: IpVersion,
    root: Node<R>,
}

impl<R: Clone + Ord> CidrTrie<R> {
    pub fn new(version: IpVersion) -> Self {
        Self {
            version,
            root: Node::Leaf {
                covered: false,
                records: Vec::new(),
            },
        }
    }

    #[inline]
    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Registers `record` under `prefix`. Records registered at one prefix
    /// form a set: re-inserting an equal record is a no-op.
    ///
    /// Never fails for a codec-validated prefix of this trie's family;
    /// passing a prefix of the other family is a caller bug and panics.
    pub fn insert(&mut self, prefix: &Cidr, record: R) {
        assert_eq!(
            prefix.version(),
            self.version,
            "prefix family must match the trie family"
        );
        self.root.insert(prefix, &record, 0);
    }

    /// Returns the records of every registered prefix containing `address`.
    /// The slice is sorted by `R`'s ordering and free of duplicates; an
    /// address outside all registered blocks yields an empty slice.
    pub fn query(&self, address: u128) -> &[R] {
        let bits = self.version.bits();
        let mut node = &self.root;
        let mut depth = 0u32;
        loop {
            match node {
                Node::Leaf { covered, records } => {
                    debug_assert!(
                        *covered || records.is_empty(),
                        "uncovered leaf must carry no records"
                    );
                    return records;
                }
                Node::Interior { children } => {
                    // Structurally impossible after a correct insert; if it
                    // trips, the trie is corrupt and continuing would return
                    // wrong answers.
                    assert!(depth < bits, "corrupt trie: interior node at depth {depth}");
                    node = &children[bit_at(address, bits, depth)];
                    depth += 1;
                }
            }
        }
    }

    /// True until the first insert.
    pub fn is_empty(&self) -> bool {
        matches!(
            &self.root,
            Node::Leaf { covered: false, records } if records.is_empty()
        )
    }

    /// Total node count, interior and leaf. Bounded by the number of
    /// distinct prefix boundaries thanks to compaction.
    pub fn node_count(&self) -> usize {
        self.root.count()
    }
}

// =============================================================================
// Range records & bulk document
// =============================================================================

/// Metadata attached to one registered block, in the shape published by
/// AWS's `ip-ranges.json`. `prefix` keeps the original CIDR text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeEntry {
    pub prefix: String,
    pub region: String,
    pub service: String,
    pub network_border_group: String,
}

/// One IPv4 row of the bulk document.
#[derive(Debug, Clone, Deserialize)]
pub struct V4RangeRecord {
    pub ip_prefix: String,
    pub region: String,
    pub service: String,
    pub network_border_group: String,
}

/// One IPv6 row of the bulk document.
#[derive(Debug, Clone, Deserialize)]
pub struct V6RangeRecord {
    pub ipv6_prefix: String,
    pub region: String,
    pub service: String,
    pub network_border_group: String,
}

/// The published range document. Fetching and caching it is the caller's
/// problem; this crate only consumes the parsed form.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeFile {
    #[serde(rename = "syncToken")]
    pub sync_token: String,
    #[serde(rename = "createDate")]
    pub create_date: String,
    #[serde(default)]
    pub prefixes: Vec<V4RangeRecord>,
    #[serde(default)]
    pub ipv6_prefixes: Vec<V6RangeRecord>,
}

// =============================================================================
// Lookup orchestration
// =============================================================================

/// Service tag AWS uses as a catch-all duplicate of more specific
/// per-service rows.
pub const DEFAULT_UMBRELLA_SERVICE: &str = "AMAZON";

/// One trie per address family plus the umbrella-service disambiguation
/// rule applied to multi-record matches.
///
/// Built once from a bulk feed, then queried read-only for the rest of the
/// session.
pub struct RangeLookup {
    v4: CidrTrie<RangeEntry>,
    v6: CidrTrie<RangeEntry>,
    umbrella_service: String,
}

impl RangeLookup {
    pub fn new() -> Self {
        Self::with_umbrella_service(DEFAULT_UMBRELLA_SERVICE)
    }

    /// Uses `service` instead of [`DEFAULT_UMBRELLA_SERVICE`] as the
    /// catch-all tag dropped from multi-record matches.
    pub fn with_umbrella_service(service: impl Into<String>) -> Self {
        Self {
            v4: CidrTrie::new(IpVersion::V4),
            v6: CidrTrie::new(IpVersion::V6),
            umbrella_service: service.into(),
        }
    }

    /// Loads a JSON range document (the `ip-ranges.json` shape).
    pub fn from_json(text: &str) -> Result<Self, LoadError> {
        Self::from_document(&serde_json::from_str(text)?)
    }

    /// Bulk-loads both families from a parsed range document.
    pub fn from_document(document: &RangeFile) -> Result<Self, LoadError> {
        let mut lookup = Self::new();
        for row in &document.prefixes {
            lookup.insert(
                IpVersion::V4,
                &row.ip_prefix,
                RangeEntry {
                    prefix: row.ip_prefix.clone(),
                    region: row.region.clone(),
                    service: row.service.clone(),
                    network_border_group: row.network_border_group.clone(),
                },
            )?;
        }
        for row in &document.ipv6_prefixes {
            lookup.insert(
                IpVersion::V6,
                &row.ipv6_prefix,
                RangeEntry {
                    prefix: row.ipv6_prefix.clone(),
                    region: row.region.clone(),
                    service: row.service.clone(),
                    network_border_group: row.network_border_group.clone(),
                },
            )?;
        }
        Ok(lookup)
    }

    /// Registers one block under the family's trie.
    pub fn insert(
        &mut self,
        version: IpVersion,
        cidr: &str,
        entry: RangeEntry,
    ) -> Result<(), ParseError> {
        let prefix = parse_cidr(version, cidr)?;
        match version {
            IpVersion::V4 => self.v4.insert(&prefix, entry),
            IpVersion::V6 => self.v6.insert(&prefix, entry),
        }
        Ok(())
    }

    /// Queries one already-parsed address and applies the umbrella filter.
    pub fn lookup(&self, version: IpVersion, address: u128) -> Vec<RangeEntry> {
        let matches = match version {
            IpVersion::V4 => self.v4.query(address),
            IpVersion::V6 => self.v6.query(address),
        };
        self.disambiguate(matches.to_vec())
    }

    /// Looks up a literal address of either family. `None` means the text is
    /// not a literal at all, the caller's cue to resolve it as a hostname
    /// and feed the answers to [`RangeLookup::lookup_resolved`].
    pub fn lookup_literal(&self, text: &str) -> Option<Vec<RangeEntry>> {
        if let Ok(address) = parse_address(IpVersion::V4, text) {
            return Some(self.lookup(IpVersion::V4, address));
        }
        if let Ok(address) = parse_address(IpVersion::V6, text) {
            return Some(self.lookup(IpVersion::V6, address));
        }
        None
    }

    /// Queries every resolved literal in turn and merges the results,
    /// collapsing duplicates. Non-literal entries are skipped.
    pub fn lookup_resolved<'a, I>(&self, addresses: I) -> Vec<RangeEntry>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut merged: Vec<RangeEntry> = Vec::new();
        for text in addresses {
            let Some(matches) = self.lookup_literal(text) else {
                continue;
            };
            for entry in matches {
                if !merged.contains(&entry) {
                    merged.push(entry);
                }
            }
        }
        merged
    }

    /// Drops umbrella-tagged records from a multi-record match, unless doing
    /// so would empty the result. A single record is never filtered.
    fn disambiguate(&self, mut matches: Vec<RangeEntry>) -> Vec<RangeEntry> {
        if matches.len() <= 1 {
            return matches;
        }
        let specific = matches
            .iter()
            .filter(|m| m.service != self.umbrella_service)
            .count();
        if specific > 0 && specific < matches.len() {
            matches.retain(|m| m.service != self.umbrella_service);
        }
        matches
    }
}

impl Default for RangeLookup {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod proptests;
