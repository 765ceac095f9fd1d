//! Shard lifecycle
//!
//! Metadata and physical stores are changed in a fixed order so a crash
//! never leaves a registered shard without a store:
//!
//! - create: provision the store, then register shard and mapping
//! - drop: unregister the shard, then destroy the store
//!
//! A store provisioned for a registration that then failed is left in
//! place; the next create with the same name picks it up again.

use shardmap_client::Connector;
use shardmap_common::{
    Error, Mapping, Range, Result, Shard, ShardKey, ShardLocation, config::ShardsConfig,
};
use shardmap_routing::MappingCache;
use shardmap_store::{ShardMapSnapshot, ShardMapStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Creates, reuses and drops shards of one shard map
pub struct ShardLifecycleManager<K> {
    cache: Arc<MappingCache<K>>,
    connector: Arc<dyn Connector>,
    server: String,
    shards: ShardsConfig,
}

impl<K: ShardKey> ShardLifecycleManager<K> {
    pub fn new(
        cache: Arc<MappingCache<K>>,
        connector: Arc<dyn Connector>,
        server: impl Into<String>,
        shards: ShardsConfig,
    ) -> Self {
        Self {
            cache,
            connector,
            server: server.into(),
            shards,
        }
    }

    fn store(&self) -> &ShardMapStore {
        self.cache.store()
    }

    fn map(&self) -> &str {
        self.cache.map_name()
    }

    /// Map `range` to a shard: an existing empty shard if there is one,
    /// otherwise a newly provisioned store.
    pub async fn create_shard(&self, range: Range<K>) -> Result<(Shard, Mapping<K>)> {
        let snapshot = self.cache.refresh()?;
        if let Some(existing) = snapshot.overlapping(&range) {
            return Err(Error::RangeOverlap {
                range: range.to_string(),
                existing: existing.range.to_string(),
                mapping_id: existing.id,
                shard_id: existing.shard_id,
            });
        }

        let reusable = snapshot.empty_shards().into_iter().find(Shard::is_active);
        let created = if let Some(shard) = reusable {
            let mapping = self.store().add_mapping(self.map(), range, shard.id)?;
            (shard, mapping)
        } else {
            let location = self.next_location(&snapshot);
            self.connector.create_store(&location).await?;
            match self
                .store()
                .add_shard_with_mapping(self.map(), location.clone(), range)
            {
                Ok(created) => created,
                Err(e) => {
                    error!(
                        "Registering {} failed after its store was provisioned: {}",
                        location, e
                    );
                    self.cache.invalidate();
                    return Err(Error::ProvisioningRollback {
                        location: location.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        self.cache.invalidate();
        info!(
            "Mapped {} to shard {} at {}",
            created.1.range, created.0.id, created.0.location
        );
        Ok(created)
    }

    /// Like `create_shard`, but `range` must start exactly where the current
    /// coverage ends
    pub async fn extend(&self, range: Range<K>) -> Result<(Shard, Mapping<K>)> {
        let snapshot = self.cache.refresh()?;
        check_contiguous(&snapshot, &range)?;
        self.create_shard(range).await
    }

    /// Return a registered shard without mappings, provisioning one if none
    /// exists
    pub async fn create_or_get_empty_shard(&self) -> Result<Shard> {
        let snapshot = self.cache.refresh()?;
        if let Some(shard) = snapshot.empty_shards().into_iter().next() {
            return Ok(shard);
        }

        let location = self.next_location(&snapshot);
        self.connector.create_store(&location).await?;
        let shard = self
            .store()
            .add_shard(self.map(), location.clone())
            .map_err(|e| {
                error!(
                    "Registering {} failed after its store was provisioned: {}",
                    location, e
                );
                Error::ProvisioningRollback {
                    location: location.to_string(),
                    reason: e.to_string(),
                }
            })?;
        self.cache.invalidate();
        info!("Added empty shard {} at {}", shard.id, shard.location);
        Ok(shard)
    }

    /// Registered shards that no mapping points at
    pub fn find_empty_shards(&self) -> Result<Vec<Shard>> {
        Ok(self.cache.refresh()?.empty_shards())
    }

    /// Unregister an empty shard and destroy its store
    pub async fn drop_shard(&self, shard: &Shard) -> Result<()> {
        self.unregister_shard(shard)?;
        self.destroy_store(&shard.location)
            .await
            .map_err(|e| orphaned(&shard.location, &e))
    }

    /// Remove an empty shard from the shard map, leaving its store
    pub fn unregister_shard(&self, shard: &Shard) -> Result<()> {
        self.store().remove_shard(self.map(), shard)?;
        self.cache.invalidate();
        Ok(())
    }

    /// Destroy the store of a shard that is no longer registered
    pub async fn destroy_store(&self, location: &ShardLocation) -> Result<()> {
        self.connector.drop_store(location).await?;
        info!("Dropped store {}", location);
        Ok(())
    }

    /// Drop every shard without mappings. Shards that gained a mapping or
    /// were dropped by someone else since the scan are skipped.
    pub async fn drop_empty_shards(&self) -> Result<Vec<Shard>> {
        let mut dropped = Vec::new();
        for shard in self.find_empty_shards()? {
            match self.drop_shard(&shard).await {
                Ok(()) => dropped.push(shard),
                Err(e @ (Error::ShardNotEmpty { .. } | Error::ShardNotFound(_))) => {
                    debug!("Skipping shard {}: {}", shard.location, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dropped)
    }

    /// Destroy every shard store, then delete the shard map
    pub async fn drop_all(&self) -> Result<()> {
        let shards = self.store().get_shards(self.map())?;
        for shard in &shards {
            self.destroy_store(&shard.location).await?;
        }
        self.store().delete_shard_map(self.map())?;
        self.cache.invalidate();
        Ok(())
    }

    /// First location whose database name is not taken by a registered shard
    fn next_location(&self, snapshot: &ShardMapSnapshot<K>) -> ShardLocation {
        let taken: HashSet<&str> = snapshot
            .shards
            .iter()
            .map(|s| s.location.database.as_str())
            .collect();
        let mut index = 0;
        loop {
            let database = self.shards.database_name(self.map(), index);
            if !taken.contains(database.as_str()) {
                return ShardLocation::new(self.server.clone(), database);
            }
            index += 1;
        }
    }
}

/// Error for a store left behind after its shard was unregistered
pub(crate) fn orphaned(location: &ShardLocation, cause: &Error) -> Error {
    error!("Store {} is orphaned: {}", location, cause);
    Error::OrphanedStore {
        location: location.to_string(),
        reason: cause.to_string(),
    }
}

/// A new range must start at the current maximum high key. Any start is
/// allowed while the map has no mappings.
fn check_contiguous<K: ShardKey>(snapshot: &ShardMapSnapshot<K>, range: &Range<K>) -> Result<()> {
    let Some(top) = snapshot.top_mapping() else {
        return Ok(());
    };
    match top.range.high() {
        None => Err(Error::ContiguityViolation {
            expected: format!("no extension past unbounded range {}", top.range),
            actual: range.low().to_string(),
        }),
        Some(high) if high == range.low() => Ok(()),
        Some(high) => Err(Error::ContiguityViolation {
            expected: high.to_string(),
            actual: range.low().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shardmap_client::{MemoryConnector, ShardConnection};
    use tempfile::TempDir;

    const MAP: &str = "CustomerIDShardMap";

    struct Fixture {
        _dir: TempDir,
        store: Arc<ShardMapStore>,
        connector: MemoryConnector,
        lifecycle: ShardLifecycleManager<i32>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ShardMapStore::open(dir.path().join("manager.redb")).unwrap());
        store.initialize().unwrap();
        store.create_shard_map::<i32>(MAP).unwrap();
        let connector = MemoryConnector::new();
        let cache = Arc::new(MappingCache::new(Arc::clone(&store), MAP));
        let lifecycle = ShardLifecycleManager::new(
            cache,
            Arc::new(connector.clone()),
            "localhost",
            ShardsConfig::default(),
        );
        Fixture {
            _dir: dir,
            store,
            connector,
            lifecycle,
        }
    }

    #[tokio::test]
    async fn test_create_shard_provisions_named_store() {
        let f = fixture();
        let (shard, mapping) = f
            .lifecycle
            .create_shard(Range::new(0, 100).unwrap())
            .await
            .unwrap();
        assert_eq!(shard.location.database, "CustomerIDShardMap_shard0");
        assert_eq!(mapping.shard_id, shard.id);
        assert!(f.connector.store_exists(&shard.location).await.unwrap());

        let (second, _) = f
            .lifecycle
            .create_shard(Range::new(100, 200).unwrap())
            .await
            .unwrap();
        assert_eq!(second.location.database, "CustomerIDShardMap_shard1");
    }

    #[tokio::test]
    async fn test_create_shard_rejects_overlap_before_provisioning() {
        let f = fixture();
        f.lifecycle
            .create_shard(Range::new(0, 100).unwrap())
            .await
            .unwrap();
        let err = f
            .lifecycle
            .create_shard(Range::new(50, 150).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RangeOverlap { .. }));
        assert_eq!(f.connector.stores().len(), 1);
    }

    #[tokio::test]
    async fn test_create_shard_reuses_empty_shard() {
        let f = fixture();
        let empty = f.lifecycle.create_or_get_empty_shard().await.unwrap();
        let again = f.lifecycle.create_or_get_empty_shard().await.unwrap();
        assert_eq!(empty.id, again.id);

        let (shard, _) = f
            .lifecycle
            .create_shard(Range::new(0, 100).unwrap())
            .await
            .unwrap();
        assert_eq!(shard.id, empty.id);
        assert_eq!(f.connector.stores().len(), 1);
    }

    #[tokio::test]
    async fn test_extend_requires_contiguity() {
        let f = fixture();
        // First range may start anywhere
        f.lifecycle
            .extend(Range::new(-50, 100).unwrap())
            .await
            .unwrap();

        let err = f
            .lifecycle
            .extend(Range::new(150, 200).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ContiguityViolation { ref expected, ref actual }
                if expected == "100" && actual == "150"
        ));

        f.lifecycle.extend(Range::unbounded(100)).await.unwrap();
        assert!(matches!(
            f.lifecycle.extend(Range::new(500, 600).unwrap()).await,
            Err(Error::ContiguityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_and_drop_empty_shards() {
        let f = fixture();
        let (a, _) = f
            .lifecycle
            .create_shard(Range::new(0, 100).unwrap())
            .await
            .unwrap();
        let (b, _) = f
            .lifecycle
            .create_shard(Range::new(100, 200).unwrap())
            .await
            .unwrap();
        let c = f.lifecycle.create_or_get_empty_shard().await.unwrap();

        let empty = f.lifecycle.find_empty_shards().unwrap();
        assert_eq!(empty, vec![c.clone()]);

        assert!(matches!(
            f.lifecycle.drop_shard(&a).await,
            Err(Error::ShardNotEmpty { .. })
        ));

        let dropped = f.lifecycle.drop_empty_shards().await.unwrap();
        assert_eq!(dropped, vec![c.clone()]);
        assert!(!f.connector.store_exists(&c.location).await.unwrap());

        let remaining: Vec<_> = f
            .store
            .get_shards(MAP)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&a.id) && remaining.contains(&b.id));
    }

    #[tokio::test]
    async fn test_failed_store_drop_names_orphan() {
        let f = fixture();
        let shard = f.lifecycle.create_or_get_empty_shard().await.unwrap();
        f.connector.fail_drops(&shard.location, 1);

        let err = f.lifecycle.drop_shard(&shard).await.unwrap_err();
        let Error::OrphanedStore { location, .. } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(location, &shard.location.to_string());
        assert!(f.store.get_shard(MAP, shard.id).unwrap().is_none());
        assert!(f.connector.store_exists(&shard.location).await.unwrap());

        f.lifecycle.destroy_store(&shard.location).await.unwrap();
        assert!(!f.connector.store_exists(&shard.location).await.unwrap());
    }

    /// Registers an overlapping mapping while a store is being provisioned,
    /// like a concurrent writer would
    struct RacingConnector {
        inner: MemoryConnector,
        store: Arc<ShardMapStore>,
    }

    #[async_trait]
    impl Connector for RacingConnector {
        async fn open(&self, location: &ShardLocation) -> Result<Box<dyn ShardConnection>> {
            self.inner.open(location).await
        }

        async fn ping(&self, server: &str) -> bool {
            self.inner.ping(server).await
        }

        async fn store_exists(&self, location: &ShardLocation) -> Result<bool> {
            self.inner.store_exists(location).await
        }

        async fn create_store(&self, location: &ShardLocation) -> Result<()> {
            self.inner.create_store(location).await?;
            self.store.add_shard_with_mapping(
                MAP,
                ShardLocation::new("elsewhere", "racer"),
                Range::new(0, 1_000).unwrap(),
            )?;
            Ok(())
        }

        async fn drop_store(&self, location: &ShardLocation) -> Result<()> {
            self.inner.drop_store(location).await
        }
    }

    #[tokio::test]
    async fn test_registration_failure_is_provisioning_rollback() {
        let f = fixture();
        let cache = Arc::new(MappingCache::new(Arc::clone(&f.store), MAP));
        let lifecycle = ShardLifecycleManager::new(
            cache,
            Arc::new(RacingConnector {
                inner: f.connector.clone(),
                store: Arc::clone(&f.store),
            }),
            "localhost",
            ShardsConfig::default(),
        );

        let err = lifecycle
            .create_shard(Range::new(0, 100).unwrap())
            .await
            .unwrap_err();
        let Error::ProvisioningRollback { location, reason } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(location, "localhost/CustomerIDShardMap_shard0");
        assert!(reason.contains("overlap"), "{reason}");

        // The provisioned store is left in place
        assert!(
            f.connector
                .store_exists(&ShardLocation::new("localhost", "CustomerIDShardMap_shard0"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_drop_all_removes_stores_and_map() {
        let f = fixture();
        for (low, high) in [(0, 100), (100, 200)] {
            f.lifecycle
                .create_shard(Range::new(low, high).unwrap())
                .await
                .unwrap();
        }
        f.lifecycle.drop_all().await.unwrap();
        assert!(f.connector.stores().is_empty());
        assert!(f.store.get_shard_map(MAP).unwrap().is_none());
    }
}
