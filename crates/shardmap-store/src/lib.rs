//! Shardmap Store - Durable shard map metadata
//!
//! This crate persists shard maps, shards, range mappings and schema info in
//! a single redb file and enforces the range invariants transactionally.

pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use snapshot::ShardMapSnapshot;
pub use store::{ShardMapStore, StoreError, StoreResult};
pub use types::MappingVersion;
