//! Connection scoped to the shard that owns a key.

use shardmap_client::{Row, ShardConnection};
use shardmap_common::{Mapping, Result, Shard, ShardLocation};
use tracing::warn;

/// An open connection together with the routing decision that produced it
pub struct ScopedConnection<K> {
    mapping: Mapping<K>,
    shard: Shard,
    conn: Box<dyn ShardConnection>,
    closed: bool,
}

impl<K> ScopedConnection<K> {
    pub(crate) fn new(mapping: Mapping<K>, shard: Shard, conn: Box<dyn ShardConnection>) -> Self {
        Self {
            mapping,
            shard,
            conn,
            closed: false,
        }
    }

    /// Mapping the key resolved to
    #[must_use]
    pub const fn mapping(&self) -> &Mapping<K> {
        &self.mapping
    }

    #[must_use]
    pub const fn shard(&self) -> &Shard {
        &self.shard
    }

    #[must_use]
    pub fn location(&self) -> &ShardLocation {
        self.conn.location()
    }

    pub async fn query(&mut self, text: &str) -> Result<Vec<Row>> {
        self.conn.query(text).await
    }

    pub async fn execute(&mut self, text: &str) -> Result<u64> {
        self.conn.execute(text).await
    }

    /// Release the underlying connection
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.conn.close().await
    }
}

impl<K> Drop for ScopedConnection<K> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "Connection to {} dropped without close",
                self.shard.location
            );
        }
    }
}
