//! Connector traits
//!
//! A `Connector` provisions, opens and drops physical shard stores. The
//! shard map never talks to a store directly; it resolves a location and
//! hands it to the connector.

use crate::value::Row;
use async_trait::async_trait;
use shardmap_common::{Result, ShardLocation};

/// An open connection to one physical shard store
#[async_trait]
pub trait ShardConnection: Send {
    /// Location this connection was opened against
    fn location(&self) -> &ShardLocation;

    /// Run a statement that produces rows
    async fn query(&mut self, text: &str) -> Result<Vec<Row>>;

    /// Run a statement and return the number of affected rows
    async fn execute(&mut self, text: &str) -> Result<u64>;

    /// Release the connection. Calling it twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Access to the physical stores that back shards
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to an existing store
    async fn open(&self, location: &ShardLocation) -> Result<Box<dyn ShardConnection>>;

    /// Check whether a server is reachable
    async fn ping(&self, server: &str) -> bool;

    async fn store_exists(&self, location: &ShardLocation) -> Result<bool>;

    /// Provision a store. Succeeds if it already exists.
    async fn create_store(&self, location: &ShardLocation) -> Result<()>;

    /// Destroy a store. Succeeds if it does not exist.
    async fn drop_store(&self, location: &ShardLocation) -> Result<()>;
}
