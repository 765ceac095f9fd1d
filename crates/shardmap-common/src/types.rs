//! Core type definitions for shardmap
//!
//! This module defines the shard map data model: ordered keys, key ranges,
//! shards, range mappings and the schema registry used by multi-shard
//! queries.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A totally ordered key type that can partition a shard map.
///
/// `KEY_TYPE` is recorded when a shard map is created so that a map built
/// for one key type is never opened with another.
pub trait ShardKey:
    Ord + Clone + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable name of the key type
    const KEY_TYPE: &'static str;
}

impl ShardKey for i32 {
    const KEY_TYPE: &'static str = "i32";
}

impl ShardKey for i64 {
    const KEY_TYPE: &'static str = "i64";
}

impl ShardKey for u32 {
    const KEY_TYPE: &'static str = "u32";
}

impl ShardKey for u64 {
    const KEY_TYPE: &'static str = "u64";
}

impl ShardKey for String {
    const KEY_TYPE: &'static str = "string";
}

impl ShardKey for Uuid {
    const KEY_TYPE: &'static str = "uuid";
}

/// Half-open key interval `[low, high)`.
///
/// `high == None` means the range is unbounded and extends to positive
/// infinity. Ranges are immutable; a mapping whose range changes is
/// retired and replaced.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range<K> {
    low: K,
    high: Option<K>,
}

impl<K: ShardKey> Range<K> {
    /// Create a bounded range, rejecting `low >= high`
    pub fn new(low: K, high: K) -> Result<Self> {
        if low >= high {
            return Err(Error::InvalidRange(format!(
                "low {low} must be less than high {high}"
            )));
        }
        Ok(Self {
            low,
            high: Some(high),
        })
    }

    /// Create a range covering every key from `low` upward
    #[must_use]
    pub const fn unbounded(low: K) -> Self {
        Self { low, high: None }
    }

    /// Create a range from an optional upper bound
    pub fn with_high(low: K, high: Option<K>) -> Result<Self> {
        match high {
            Some(high) => Self::new(low, high),
            None => Ok(Self::unbounded(low)),
        }
    }

    /// Inclusive lower bound
    #[must_use]
    pub const fn low(&self) -> &K {
        &self.low
    }

    /// Exclusive upper bound, `None` when unbounded
    #[must_use]
    pub const fn high(&self) -> Option<&K> {
        self.high.as_ref()
    }

    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.high.is_none()
    }

    /// True if `key` lies below the upper bound
    fn is_below_high(&self, key: &K) -> bool {
        self.high.as_ref().is_none_or(|high| key < high)
    }

    /// Check whether `key` falls inside the range
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        &self.low <= key && self.is_below_high(key)
    }

    /// Check whether two ranges share at least one key
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.is_below_high(&other.low) && other.is_below_high(&self.low)
    }

    /// Compare two upper bounds, treating unbounded as greater than any key
    #[must_use]
    pub fn cmp_high(&self, other: &Self) -> Ordering {
        match (&self.high, &other.high) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }

    /// Split into owned bounds
    #[must_use]
    pub fn into_parts(self) -> (K, Option<K>) {
        (self.low, self.high)
    }
}

impl<K: fmt::Display> fmt::Display for Range<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.high {
            Some(high) => write!(f, "[{}, {})", self.low, high),
            None => write!(f, "[{}, +inf)", self.low),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Range<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.high {
            Some(high) => write!(f, "Range[{:?}, {:?})", self.low, high),
            None => write!(f, "Range[{:?}, +inf)", self.low),
        }
    }
}

/// Unique identifier for a shard
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct ShardId(Uuid);

impl ShardId {
    /// Generate a new random shard ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a range mapping
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct MappingId(Uuid);

impl MappingId {
    /// Generate a new random mapping ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MappingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappingId({})", self.0)
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one physical store: the server hosting it and the
/// database name on that server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{server}/{database}")]
pub struct ShardLocation {
    pub server: String,
    pub database: String,
}

impl ShardLocation {
    #[must_use]
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
        }
    }
}

/// Shard lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ShardStatus {
    /// Shard accepts connections
    #[default]
    Active,
    /// Shard is unavailable for routing and queries
    Offline,
}

/// A registered physical store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub location: ShardLocation,
    pub status: ShardStatus,
    /// Row version, bumped on every update
    pub version: u64,
}

impl Shard {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ShardStatus::Active
    }
}

/// Mapping availability
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MappingStatus {
    #[default]
    Online,
    /// Mapping is being changed and must not be routed to
    Offline,
}

/// Association of one key range with the shard that owns it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping<K> {
    pub id: MappingId,
    pub range: Range<K>,
    pub shard_id: ShardId,
    pub status: MappingStatus,
    /// Row version, bumped on every update
    pub version: u64,
}

impl<K> Mapping<K> {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == MappingStatus::Online
    }
}

/// Descriptor of a named shard map
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMapInfo {
    pub name: String,
    pub key_type: String,
    /// Topology version, bumped by every shard or mapping mutation
    pub version: u64,
}

/// One shard that failed during a multi-shard operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard_id: ShardId,
    pub location: ShardLocation,
    pub reason: String,
}

impl ShardFailure {
    #[must_use]
    pub fn new(shard: &Shard, reason: impl Into<String>) -> Self {
        Self {
            shard_id: shard.id,
            location: shard.location.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.location, self.reason)
    }
}

/// How a table is laid out across shards
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Rows partitioned by the shard key column
    Sharded { key_column: String },
    /// Full contents replicated on every shard
    Reference,
}

/// Table registered in a shard map's schema info
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub kind: TableKind,
}

/// Registry of sharded and reference tables for one shard map.
///
/// Table names are matched case-insensitively.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    tables: BTreeMap<String, TableInfo>,
}

impl SchemaInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table partitioned by `key_column`
    pub fn add_sharded(&mut self, name: impl Into<String>, key_column: impl Into<String>) {
        self.insert(TableInfo {
            name: name.into(),
            kind: TableKind::Sharded {
                key_column: key_column.into(),
            },
        });
    }

    /// Register a table replicated on every shard
    pub fn add_reference(&mut self, name: impl Into<String>) {
        self.insert(TableInfo {
            name: name.into(),
            kind: TableKind::Reference,
        });
    }

    fn insert(&mut self, table: TableInfo) {
        self.tables.insert(table.name.to_ascii_lowercase(), table);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn is_reference(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|t| t.kind == TableKind::Reference)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_range_rejects_empty_interval() {
        assert!(Range::new(5, 5).is_err());
        assert!(Range::new(6, 5).is_err());
        assert!(Range::new(5, 6).is_ok());
    }

    #[test]
    fn test_range_contains() {
        let range = Range::new(0, 100).unwrap();
        assert!(range.contains(&0));
        assert!(range.contains(&99));
        assert!(!range.contains(&100));
        assert!(!range.contains(&-1));

        let open = Range::unbounded(100);
        assert!(open.contains(&100));
        assert!(open.contains(&i32::MAX));
        assert!(!open.contains(&99));
    }

    #[test]
    fn test_range_intersects() {
        let a = Range::new(0, 100).unwrap();
        let b = Range::new(100, 200).unwrap();
        let c = Range::new(50, 150).unwrap();
        let open = Range::unbounded(150);

        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
        assert!(b.intersects(&open));
        assert!(!a.intersects(&open));
        assert!(open.intersects(&Range::unbounded(1_000)));
    }

    #[test]
    fn test_range_intersects_matches_pointwise_overlap() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let a_low = rng.gen_range(0..50);
            let a = Range::new(a_low, a_low + rng.gen_range(1..20)).unwrap();
            let b_low = rng.gen_range(0..50);
            let b = Range::new(b_low, b_low + rng.gen_range(1..20)).unwrap();
            let shared = (0..80).any(|k| a.contains(&k) && b.contains(&k));
            assert_eq!(a.intersects(&b), shared, "{a} vs {b}");
        }
    }

    #[test]
    fn test_range_display() {
        assert_eq!(Range::new(0, 100).unwrap().to_string(), "[0, 100)");
        assert_eq!(Range::unbounded(7).to_string(), "[7, +inf)");
    }

    #[test]
    fn test_cmp_high_unbounded_is_greatest() {
        let bounded = Range::new(0, i64::MAX).unwrap();
        let open = Range::unbounded(0);
        assert_eq!(open.cmp_high(&bounded), Ordering::Greater);
        assert_eq!(bounded.cmp_high(&open), Ordering::Less);
    }

    #[test]
    fn test_string_keys() {
        let range = Range::new("m".to_string(), "t".to_string()).unwrap();
        assert!(range.contains(&"pear".to_string()));
        assert!(!range.contains(&"apple".to_string()));
    }

    #[test]
    fn test_schema_info_lookup_is_case_insensitive() {
        let mut schema = SchemaInfo::new();
        schema.add_reference("Regions");
        schema.add_sharded("Tenants", "TenantId");

        assert!(schema.is_reference("regions"));
        assert!(!schema.is_reference("TENANTS"));
        assert_eq!(
            schema.get("tenants").map(|t| &t.kind),
            Some(&TableKind::Sharded {
                key_column: "TenantId".into()
            })
        );
        assert!(schema.get("Things").is_none());
    }

    #[test]
    fn test_location_display() {
        let location = ShardLocation::new("localhost", "shard0");
        assert_eq!(location.to_string(), "localhost/shard0");
    }
}
