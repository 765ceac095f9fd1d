//! Redb table definitions for persistent shard map metadata.

use redb::TableDefinition;

// Key: "manager", Value: bincode-encoded StoredManager
pub const MANAGER: TableDefinition<&str, &[u8]> = TableDefinition::new("manager");

// Key: shard map name, Value: bincode-encoded ShardMapInfo
pub const SHARD_MAPS: TableDefinition<&str, &[u8]> = TableDefinition::new("shard_maps");

// Key: "map\x00shard_id", Value: bincode-encoded Shard
pub const SHARDS: TableDefinition<&str, &[u8]> = TableDefinition::new("shards");

// Key: "map\x00mapping_id", Value: bincode-encoded StoredMapping
pub const MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("mappings");

// Key: shard map name, Value: bincode-encoded SchemaInfo
pub const SCHEMA_INFO: TableDefinition<&str, &[u8]> = TableDefinition::new("schema_info");

/// Row key for an entity that belongs to a shard map
pub fn row_key(map: &str, id: impl std::fmt::Display) -> String {
    format!("{map}\x00{id}")
}

/// Prefix shared by every row of a shard map
pub fn map_prefix(map: &str) -> String {
    format!("{map}\x00")
}
