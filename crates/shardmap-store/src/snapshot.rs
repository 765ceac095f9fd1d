//! Point-in-time view of one shard map.
//!
//! A snapshot is read in a single transaction, so its shards and mappings
//! always satisfy the shard map invariants relative to each other.

use shardmap_common::{
    Error, Mapping, Range, Result, SchemaInfo, Shard, ShardId, ShardKey, ShardMapInfo,
};
use std::collections::HashSet;

/// Shards, mappings and schema info of a shard map
#[derive(Clone, Debug)]
pub struct ShardMapSnapshot<K> {
    pub info: ShardMapInfo,
    /// All registered shards
    pub shards: Vec<Shard>,
    /// All mappings, sorted by low key
    pub mappings: Vec<Mapping<K>>,
    pub schema: Option<SchemaInfo>,
}

impl<K: ShardKey> ShardMapSnapshot<K> {
    pub(crate) fn new(
        info: ShardMapInfo,
        shards: Vec<Shard>,
        mut mappings: Vec<Mapping<K>>,
        schema: Option<SchemaInfo>,
    ) -> Self {
        mappings.sort_by(|a, b| a.range.low().cmp(b.range.low()));
        Self {
            info,
            shards,
            mappings,
            schema,
        }
    }

    /// Topology version this snapshot was taken at
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.info.version
    }

    #[must_use]
    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shards.iter().find(|s| s.id == id)
    }

    /// Find the mapping that owns `key`.
    ///
    /// Binary search for the last mapping whose low key is `<= key`; the
    /// lookup only succeeds if that mapping also covers `key` and is online.
    pub fn lookup(&self, key: &K) -> Result<&Mapping<K>> {
        let idx = self.mappings.partition_point(|m| m.range.low() <= key);
        let candidate = idx
            .checked_sub(1)
            .map(|i| &self.mappings[i])
            .filter(|m| m.range.contains(key))
            .ok_or_else(|| Error::MappingNotFound {
                key: key.to_string(),
            })?;

        if !candidate.is_online() {
            return Err(Error::MappingOffline {
                mapping_id: candidate.id,
                range: candidate.range.to_string(),
            });
        }
        Ok(candidate)
    }

    /// First mapping whose range intersects `range`
    #[must_use]
    pub fn overlapping(&self, range: &Range<K>) -> Option<&Mapping<K>> {
        self.mappings.iter().find(|m| m.range.intersects(range))
    }

    /// Mappings that point at the given shard
    pub fn mappings_for(&self, shard_id: ShardId) -> impl Iterator<Item = &Mapping<K>> {
        self.mappings.iter().filter(move |m| m.shard_id == shard_id)
    }

    /// Shards with no mapping pointing at them
    #[must_use]
    pub fn empty_shards(&self) -> Vec<Shard> {
        let referenced: HashSet<ShardId> = self.mappings.iter().map(|m| m.shard_id).collect();
        self.shards
            .iter()
            .filter(|s| !referenced.contains(&s.id))
            .cloned()
            .collect()
    }

    /// The mapping with the greatest upper bound, if any
    #[must_use]
    pub fn top_mapping(&self) -> Option<&Mapping<K>> {
        self.mappings.iter().max_by(|a, b| a.range.cmp_high(&b.range))
    }
}
