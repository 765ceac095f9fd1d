//! Stored types for shard map persistence.
//!
//! These types are serialized to redb via bincode. Mapping rows keep their
//! range bounds as encoded key bytes so that operations which only need the
//! row header (shard references, versions, status) work without knowing
//! the key type.

use serde::{Deserialize, Serialize};
use shardmap_common::{Mapping, MappingId, MappingStatus, Range, ShardId, ShardKey};

use crate::store::StoreResult;

/// Current on-disk layout version
pub const FORMAT_VERSION: u32 = 1;

/// Marker row written when the manager store is initialized
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredManager {
    pub format_version: u32,
}

/// Persisted range mapping
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMapping {
    pub id: MappingId,
    pub shard_id: ShardId,
    pub status: MappingStatus,
    pub version: u64,
    pub low: Vec<u8>,
    pub high: Option<Vec<u8>>,
}

impl StoredMapping {
    pub fn encode<K: ShardKey>(mapping: &Mapping<K>) -> StoreResult<Self> {
        let low = bincode::serialize(mapping.range.low())?;
        let high = mapping.range.high().map(bincode::serialize).transpose()?;
        Ok(Self {
            id: mapping.id,
            shard_id: mapping.shard_id,
            status: mapping.status,
            version: mapping.version,
            low,
            high,
        })
    }

    pub fn decode<K: ShardKey>(&self) -> StoreResult<Mapping<K>> {
        let low: K = bincode::deserialize(&self.low)?;
        let high: Option<K> = self
            .high
            .as_deref()
            .map(bincode::deserialize)
            .transpose()?;
        let range = Range::with_high(low, high)?;
        Ok(Mapping {
            id: self.id,
            range,
            shard_id: self.shard_id,
            status: self.status,
            version: self.version,
        })
    }
}

/// Version and status of a mapping row, used to re-validate a routing
/// decision without decoding the range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingVersion {
    pub version: u64,
    pub status: MappingStatus,
}
