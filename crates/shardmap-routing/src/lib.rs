//! Shardmap Routing - Data-dependent routing
//!
//! This crate resolves a sharding key to the shard that owns it and hands
//! out connections scoped to that shard. Routing reads a cached snapshot of
//! the shard map and re-validates every decision against the store before
//! the connection is returned.

pub mod cache;
pub mod connection;
pub mod resolver;
pub mod retry;

// Re-exports
pub use cache::MappingCache;
pub use connection::ScopedConnection;
pub use resolver::RoutingResolver;
pub use retry::retry_with_backoff;
