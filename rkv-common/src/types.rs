//! # Partition and Location Types
//!
//! Core identities used to route a row to the server that currently owns it.
//!
//! ## Design Principles
//!
//! 1. **Cheap Clones**: Keys and table names are `Bytes`, so cloning a descriptor
//!    into a cache entry or a request is a ref-count bump, not a copy.
//!
//! 2. **Immutable Locations**: A `Location` is never mutated after construction. A
//!    newer placement replaces the old value wholesale, ordered by its open
//!    sequence number.
//!
//! 3. **Byte Order Routing**: Start keys compare as raw bytes; partitions of a
//!    healthy table tile the key space `[start, end)` with the empty end key meaning
//!    "unbounded".
//!
//! ## Region Name Layout
//!
//! ```text
//! region name:    <table> ',' <start key> ',' <region id>
//! metadata key:   <table> ',' <row>       ',' 99999999999999
//! ```
//!
//! Metadata rows are ordered component-wise by `(table, start key, region id)`,
//! not by the raw bytes of the name: a row such as `g!` continues with a byte
//! below the delimiter, so `users,g!,...` would sort before `users,g,1` bytewise.
//! `MetaSortKey` carries that order. Under it the metadata key sorts after every
//! region name of the table whose start key is `<= row`, so a floor lookup lands
//! on the owning partition's row.

use std::cmp::Ordering;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Name of the metadata table describing every partition of every user table.
pub const META_TABLE_NAME: &[u8] = b".META.";

/// Region id appended to metadata lookup keys; larger than any real id.
pub const META_KEY_SUFFIX: &[u8] = b"99999999999999";

/// Separator between region name components.
const REGION_NAME_DELIMITER: u8 = b',';

/// Table identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName(Bytes);

impl TableName {
    /// Creates a table name from raw bytes.
    pub fn new(name: impl Into<Bytes>) -> Self {
        TableName(name.into())
    }

    /// Returns the metadata table's name.
    pub fn meta() -> Self {
        TableName(Bytes::from_static(META_TABLE_NAME))
    }

    /// Returns true for the metadata table.
    #[inline]
    pub fn is_meta(&self) -> bool {
        self.0.as_ref() == META_TABLE_NAME
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&'static str> for TableName {
    fn from(name: &'static str) -> Self {
        TableName(Bytes::from_static(name.as_bytes()))
    }
}

impl fmt::Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableName({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Identity of one server process.
///
/// `start_code` distinguishes restarts on the same host and port, so a server
/// that came back is a different identity than the one that died.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
    pub start_code: u64,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16, start_code: u64) -> Self {
        ServerName {
            host: host.into(),
            port,
            start_code,
        }
    }

    /// Returns the `host:port` pair used to key network channels.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true when both names point at the same endpoint, ignoring restarts.
    #[inline]
    pub fn same_endpoint(&self, other: &ServerName) -> bool {
        self.port == other.port && self.host == other.host
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.host, self.port, self.start_code)
    }
}

/// Key range and state of one partition ("region").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    /// Owning table.
    pub table: TableName,
    /// Inclusive start key; empty for the first partition.
    pub start_key: Bytes,
    /// Exclusive end key; empty for the last partition.
    pub end_key: Bytes,
    /// Creation id, unique among partitions sharing a start key.
    pub region_id: u64,
    /// Partition is offline, e.g. its table is disabled.
    pub offline: bool,
    /// Partition is a split parent waiting for its daughters to come online.
    pub split: bool,
}

impl PartitionDescriptor {
    /// Creates an online descriptor for `[start_key, end_key)`.
    pub fn new(
        table: TableName,
        start_key: impl Into<Bytes>,
        end_key: impl Into<Bytes>,
        region_id: u64,
    ) -> Self {
        PartitionDescriptor {
            table,
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
            offline: false,
            split: false,
        }
    }

    /// Returns the region name `table,start,id`.
    pub fn region_name(&self) -> Bytes {
        region_name(&self.table, &self.start_key, self.region_id)
    }

    /// Returns true when `row` falls inside `[start_key, end_key)`.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_ref() && self.row_below_end(row)
    }

    /// Returns true when `row` is below the end key, or the end key is unbounded.
    #[inline]
    pub fn row_below_end(&self, row: &[u8]) -> bool {
        self.end_key.is_empty() || row < self.end_key.as_ref()
    }

    /// Human-readable region name for logs and errors.
    pub fn region_name_string(&self) -> String {
        String::from_utf8_lossy(&self.region_name()).into_owned()
    }
}

/// Where a partition currently lives.
///
/// `seq_num` is the sequence number assigned when the partition was opened on
/// `server`; higher numbers describe newer placements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    descriptor: PartitionDescriptor,
    server: ServerName,
    seq_num: u64,
}

impl Location {
    pub fn new(descriptor: PartitionDescriptor, server: ServerName, seq_num: u64) -> Self {
        Location {
            descriptor,
            server,
            seq_num,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &PartitionDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn server(&self) -> &ServerName {
        &self.server
    }

    #[inline]
    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    #[inline]
    pub fn table(&self) -> &TableName {
        &self.descriptor.table
    }

    #[inline]
    pub fn start_key(&self) -> &Bytes {
        &self.descriptor.start_key
    }

    /// Returns true when both locations are served by the same endpoint.
    #[inline]
    pub fn same_server(&self, other: &Location) -> bool {
        self.server.same_endpoint(&other.server)
    }

    /// Returns a new location for the same partition on another server.
    pub fn moved_to(&self, server: ServerName, seq_num: u64) -> Location {
        Location {
            descriptor: self.descriptor.clone(),
            server,
            seq_num,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region={}, server={}, seq={}",
            self.descriptor.region_name_string(),
            self.server.host_port(),
            self.seq_num
        )
    }
}

/// Builds a region name `table,start,id`.
pub fn region_name(table: &TableName, start_key: &[u8], region_id: u64) -> Bytes {
    let id = region_id.to_string();
    let mut buf = BytesMut::with_capacity(table.as_bytes().len() + start_key.len() + id.len() + 2);
    buf.put_slice(table.as_bytes());
    buf.put_u8(REGION_NAME_DELIMITER);
    buf.put_slice(start_key);
    buf.put_u8(REGION_NAME_DELIMITER);
    buf.put_slice(id.as_bytes());
    buf.freeze()
}

/// Builds the metadata-table key whose floor row describes the partition of `row`.
pub fn meta_key(table: &TableName, row: &[u8]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(table.as_bytes().len() + row.len() + META_KEY_SUFFIX.len() + 2);
    buf.put_slice(table.as_bytes());
    buf.put_u8(REGION_NAME_DELIMITER);
    buf.put_slice(row);
    buf.put_u8(REGION_NAME_DELIMITER);
    buf.put_slice(META_KEY_SUFFIX);
    buf.freeze()
}

/// Compares two region names (or metadata keys) by `(table, start key, region id)`.
///
/// Names that do not parse sort by their raw bytes, after every parsable name of
/// the same leading bytes. Equal components fall back to a bytewise comparison, so
/// the order is total and agrees with byte equality.
pub fn compare_region_names(a: &[u8], b: &[u8]) -> Ordering {
    match (parse_region_name(a), parse_region_name(b)) {
        (Some((ta, sa, ia)), Some((tb, sb, ib))) => ta
            .as_bytes()
            .cmp(tb.as_bytes())
            .then_with(|| sa.cmp(&sb))
            .then_with(|| ia.cmp(&ib))
            .then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Row key of the metadata table, ordered by `compare_region_names`.
///
/// Metadata stores must sort their rows by this order for `meta_key` floor lookups
/// to land on the partition owning a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaSortKey(Bytes);

impl MetaSortKey {
    pub fn new(name: impl Into<Bytes>) -> Self {
        MetaSortKey(name.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Ord for MetaSortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_region_names(&self.0, &other.0)
    }
}

impl PartialOrd for MetaSortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Splits a region name (or metadata key) into `(table, start key, region id)`.
///
/// The table ends at the first delimiter and the id starts after the last one, so
/// start keys may themselves contain delimiters. Returns `None` for malformed names.
pub fn parse_region_name(name: &[u8]) -> Option<(TableName, Bytes, u64)> {
    let first = name.iter().position(|&b| b == REGION_NAME_DELIMITER)?;
    let last = name.iter().rposition(|&b| b == REGION_NAME_DELIMITER)?;
    if last <= first {
        return None;
    }
    let id = std::str::from_utf8(&name[last + 1..]).ok()?.parse().ok()?;
    let table = TableName::new(Bytes::copy_from_slice(&name[..first]));
    let start = Bytes::copy_from_slice(&name[first + 1..last]);
    Some((table, start, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(start: &'static [u8], end: &'static [u8]) -> PartitionDescriptor {
        PartitionDescriptor::new(TableName::from("users"), start, end, 7)
    }

    #[test]
    fn region_name_parses_back() {
        let desc = descriptor(b"a,b", b"m");
        let name = desc.region_name();
        assert_eq!(&name[..], b"users,a,b,7");

        let (table, start, id) = parse_region_name(&name).expect("parse");
        assert_eq!(table, TableName::from("users"));
        assert_eq!(&start[..], b"a,b");
        assert_eq!(id, 7);
    }

    #[test]
    fn malformed_region_names_are_rejected() {
        assert!(parse_region_name(b"users").is_none());
        assert!(parse_region_name(b"users,abc").is_none());
        assert!(parse_region_name(b"users,a,notanumber").is_none());
    }

    #[test]
    fn meta_key_sorts_after_owning_region() {
        let table = TableName::from("users");
        let owner = region_name(&table, b"k", 1_700_000_000_000);
        let next = region_name(&table, b"l", 1_700_000_000_000);
        let key = meta_key(&table, b"k");
        assert!(owner < key);
        assert!(key < next);
    }

    #[test]
    fn meta_order_compares_components() {
        let table = TableName::from("users");
        let g = MetaSortKey::new(region_name(&table, b"g", 1));
        let p = MetaSortKey::new(region_name(&table, b"p", 1));

        // Bytewise, ',' (0x2c) sorts above '!' and 0x00.
        assert!(meta_key(&table, b"g!") < region_name(&table, b"g", 1));
        assert!(MetaSortKey::new(meta_key(&table, b"g!")) > g);
        assert!(MetaSortKey::new(meta_key(&table, b"g!")) < p);
        assert!(MetaSortKey::new(meta_key(&table, b"p\x00")) > p);

        // Ids compare numerically and tables before start keys.
        let g10 = MetaSortKey::new(region_name(&table, b"g", 10));
        let g9 = MetaSortKey::new(region_name(&table, b"g", 9));
        assert!(g9 < g10);
        let other = MetaSortKey::new(region_name(&TableName::from("usersx"), b"", 1));
        assert!(MetaSortKey::new(meta_key(&table, b"zzz")) < other);
    }

    #[test]
    fn contains_row_respects_bounds() {
        let desc = descriptor(b"b", b"d");
        assert!(!desc.contains_row(b"a"));
        assert!(desc.contains_row(b"b"));
        assert!(desc.contains_row(b"c"));
        assert!(!desc.contains_row(b"d"));

        let last = descriptor(b"x", b"");
        assert!(last.contains_row(b"zzzz"));
    }

    #[test]
    fn same_server_ignores_start_code() {
        let desc = descriptor(b"", b"");
        let a = Location::new(desc.clone(), ServerName::new("rs1", 16020, 1), 5);
        let b = Location::new(desc.clone(), ServerName::new("rs1", 16020, 2), 6);
        let c = Location::new(desc, ServerName::new("rs2", 16020, 1), 5);
        assert!(a.same_server(&b));
        assert!(!a.same_server(&c));
    }

    #[test]
    fn moved_to_keeps_descriptor() {
        let loc = Location::new(descriptor(b"a", b"b"), ServerName::new("rs1", 1, 1), 3);
        let moved = loc.moved_to(ServerName::new("rs2", 1, 1), 9);
        assert_eq!(moved.descriptor(), loc.descriptor());
        assert_eq!(moved.seq_num(), 9);
        assert_eq!(moved.server().host, "rs2");
    }
}
