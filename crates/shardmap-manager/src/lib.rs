//! Shardmap Manager - Shard lifecycle and the manager facade
//!
//! `ShardLifecycleManager` creates, reuses and drops shards together with
//! their physical stores. `ShardMapManager` ties the store, the mapping
//! cache, the router, the fan-out executor and the lifecycle manager into
//! the single entry point applications use.

pub mod lifecycle;
pub mod manager;

// Re-exports
pub use lifecycle::ShardLifecycleManager;
pub use manager::{ShardMapManager, ShardSummary};
