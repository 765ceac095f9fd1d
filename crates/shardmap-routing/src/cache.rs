//! Cached shard map snapshot
//!
//! The cache holds one immutable `ShardMapSnapshot` behind a lock and swaps
//! it wholesale on refresh. Readers clone the `Arc` and never block writers
//! for longer than the swap.

use parking_lot::RwLock;
use shardmap_common::{Error, Mapping, Result, SchemaInfo, Shard, ShardKey};
use shardmap_store::{ShardMapSnapshot, ShardMapStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Snapshot cache for one shard map
pub struct MappingCache<K> {
    store: Arc<ShardMapStore>,
    map_name: String,
    snapshot: RwLock<Option<Arc<ShardMapSnapshot<K>>>>,
    refreshes: AtomicU64,
}

impl<K: ShardKey> MappingCache<K> {
    pub fn new(store: Arc<ShardMapStore>, map_name: impl Into<String>) -> Self {
        Self {
            store,
            map_name: map_name.into(),
            snapshot: RwLock::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<ShardMapStore> {
        &self.store
    }

    /// Current snapshot, loaded from the store if the cache is empty
    pub fn snapshot(&self) -> Result<Arc<ShardMapSnapshot<K>>> {
        self.current().map(|(snapshot, _)| snapshot)
    }

    /// Reload the snapshot from the store
    pub fn refresh(&self) -> Result<Arc<ShardMapSnapshot<K>>> {
        let snapshot = Arc::new(self.store.load_snapshot::<K>(&self.map_name)?);
        *self.snapshot.write() = Some(Arc::clone(&snapshot));
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Refreshed '{}' at version {} ({} shards, {} mappings)",
            self.map_name,
            snapshot.version(),
            snapshot.shards.len(),
            snapshot.mappings.len()
        );
        Ok(snapshot)
    }

    /// Drop the snapshot; the next read reloads it
    pub fn invalidate(&self) {
        self.snapshot.write().take();
    }

    /// Resolve `key` to its mapping and shard.
    ///
    /// A miss or an offline mapping in a cached snapshot triggers one
    /// refresh before the error is reported.
    pub fn lookup(&self, key: &K) -> Result<(Mapping<K>, Shard)> {
        let (snapshot, fresh) = self.current()?;
        match resolve(snapshot.as_ref(), key) {
            Err(Error::MappingNotFound { .. } | Error::MappingOffline { .. }) if !fresh => {
                let snapshot = self.refresh()?;
                resolve(snapshot.as_ref(), key)
            }
            other => other,
        }
    }

    pub fn shards(&self) -> Result<Vec<Shard>> {
        Ok(self.snapshot()?.shards.clone())
    }

    pub fn schema_info(&self) -> Result<Option<SchemaInfo>> {
        Ok(self.snapshot()?.schema.clone())
    }

    /// Number of times the snapshot was loaded from the store
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn current(&self) -> Result<(Arc<ShardMapSnapshot<K>>, bool)> {
        if let Some(snapshot) = self.snapshot.read().as_ref() {
            return Ok((Arc::clone(snapshot), false));
        }
        Ok((self.refresh()?, true))
    }
}

fn resolve<K: ShardKey>(snapshot: &ShardMapSnapshot<K>, key: &K) -> Result<(Mapping<K>, Shard)> {
    let mapping = snapshot.lookup(key)?;
    let shard = snapshot
        .shard(mapping.shard_id)
        .cloned()
        .ok_or(Error::ShardNotFound(mapping.shard_id))?;
    Ok((mapping.clone(), shard))
}
