//! Shardmap Query - Multi-shard queries
//!
//! This crate runs one statement on every shard of a shard map in parallel
//! and merges the rows, tagging each with the shard it came from.

pub mod executor;
pub mod types;

// Re-exports
pub use executor::MultiShardQueryExecutor;
pub use types::{MultiShardQuery, MultiShardResult, QueryPolicy, ShardRow};
