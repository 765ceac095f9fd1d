//! Shardmap Client - Shard connectivity
//!
//! This crate defines how the router and the query executor reach physical
//! shard stores: the `Connector` and `ShardConnection` traits, the row model
//! and the statement language understood by the bundled connectors.

pub mod connector;
pub mod local;
pub mod memory;
pub mod statement;
pub mod value;

// Re-exports
pub use connector::{Connector, ShardConnection};
pub use local::LocalConnector;
pub use memory::MemoryConnector;
pub use statement::Statement;
pub use value::{Row, Value};
