//! Data-dependent routing
//!
//! A key is resolved against the cached snapshot, a connection is opened to
//! the owning shard, and the mapping is then re-read from the store. If the
//! mapping moved, went offline or was removed while the connection was being
//! opened, the connection is closed, the cache invalidated and the whole
//! resolution retried with backoff.

use crate::cache::MappingCache;
use crate::connection::ScopedConnection;
use crate::retry::retry_with_backoff;
use futures::future::BoxFuture;
use shardmap_client::Connector;
use shardmap_common::{Error, MappingStatus, Result, RetryConfig, ShardKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes keys to shard connections
pub struct RoutingResolver<K> {
    cache: Arc<MappingCache<K>>,
    connector: Arc<dyn Connector>,
    retry: RetryConfig,
}

impl<K: ShardKey> RoutingResolver<K> {
    pub fn new(cache: Arc<MappingCache<K>>, connector: Arc<dyn Connector>, retry: RetryConfig) -> Self {
        Self {
            cache,
            connector,
            retry,
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<MappingCache<K>> {
        &self.cache
    }

    /// Open a connection to the shard that owns `key`
    pub async fn connect_for_key(&self, key: &K) -> Result<ScopedConnection<K>> {
        retry_with_backoff(&self.retry, "connect_for_key", move || self.try_connect(key)).await
    }

    /// Run `op` on a connection to the shard that owns `key`. The connection
    /// is closed afterwards whether `op` succeeded or not.
    ///
    /// If the returned future is dropped while `op` is still running, the
    /// close never runs. The connection is then released by its destructor
    /// and a warning is logged.
    pub async fn with_connection<T, F>(&self, key: &K, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedConnection<K>) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.connect_for_key(key).await?;
        let result = op(&mut conn).await;
        let closed = conn.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Failed to close connection to {}: {}", conn.location(), close_err);
                }
                Err(e)
            }
        }
    }

    /// Re-read the mapping and shard rows behind a routing decision. Returns
    /// the reason the decision is no longer valid, if any.
    fn revalidate(&self, scoped: &ScopedConnection<K>) -> Option<Error> {
        let store = self.cache.store();
        let map = self.cache.map_name();
        let mapping = scoped.mapping();
        let drift = match store.mapping_version(map, mapping.id) {
            Ok(Some(current))
                if current.version == mapping.version && current.status == MappingStatus::Online =>
            {
                None
            }
            Ok(Some(current)) if current.status == MappingStatus::Offline => {
                Some(Error::MappingOffline {
                    mapping_id: mapping.id,
                    range: mapping.range.to_string(),
                })
            }
            Ok(current) => Some(Error::ConcurrencyConflict {
                entity: "mapping",
                id: mapping.id.to_string(),
                expected: mapping.version,
                actual: current.map(|c| c.version),
            }),
            Err(e) => Some(e),
        };
        if drift.is_some() {
            return drift;
        }

        // Shard status changes bump the shard row, not the mapping row
        let shard = scoped.shard();
        match store.get_shard(map, shard.id) {
            Ok(Some(current)) if !current.is_active() => Some(Error::ShardOffline {
                shard_id: shard.id,
                location: shard.location.to_string(),
            }),
            Ok(Some(current)) if current.version == shard.version => None,
            Ok(current) => Some(Error::ConcurrencyConflict {
                entity: "shard",
                id: shard.id.to_string(),
                expected: shard.version,
                actual: current.map(|c| c.version),
            }),
            Err(e) => Some(e),
        }
    }

    async fn try_connect(&self, key: &K) -> Result<ScopedConnection<K>> {
        let (mapping, shard) = self.cache.lookup(key)?;
        if !shard.is_active() {
            self.cache.invalidate();
            return Err(Error::ShardOffline {
                shard_id: shard.id,
                location: shard.location.to_string(),
            });
        }

        let conn = self.connector.open(&shard.location).await?;
        let mut scoped = ScopedConnection::new(mapping, shard, conn);
        let drift = self.revalidate(&scoped);
        if let Some(err) = drift {
            debug!(
                "Routing decision for {} went stale on {}: {}",
                key,
                scoped.shard().location,
                err
            );
            if let Err(close_err) = scoped.close().await {
                warn!("Failed to close stale connection: {}", close_err);
            }
            self.cache.invalidate();
            return Err(err);
        }
        Ok(scoped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmap_client::{MemoryConnector, Value};
    use shardmap_common::{Range, ShardLocation, ShardStatus};
    use shardmap_store::ShardMapStore;
    use std::time::Duration;
    use tempfile::TempDir;

    const MAP: &str = "CustomerIDShardMap";

    struct Fixture {
        _dir: TempDir,
        store: Arc<ShardMapStore>,
        connector: MemoryConnector,
        resolver: RoutingResolver<i32>,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ShardMapStore::open(dir.path().join("manager.redb")).unwrap());
        store.initialize().unwrap();
        store.create_shard_map::<i32>(MAP).unwrap();

        let connector = MemoryConnector::new();
        for (i, (low, high)) in [(0, 100), (100, 200)].into_iter().enumerate() {
            let location = ShardLocation::new("localhost", format!("shard{i}"));
            connector.create_store(&location).await.unwrap();
            store
                .add_shard_with_mapping(MAP, location, Range::new(low, high).unwrap())
                .unwrap();
        }

        let cache = Arc::new(MappingCache::new(Arc::clone(&store), MAP));
        let retry = RetryConfig {
            max_attempts,
            initial_backoff_ms: 20,
            max_backoff_ms: 200,
        };
        let resolver = RoutingResolver::new(cache, Arc::new(connector.clone()), retry);
        Fixture {
            _dir: dir,
            store,
            connector,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_routes_to_owning_shard() {
        let f = fixture(3).await;
        let mut conn = f.resolver.connect_for_key(&150).await.unwrap();
        assert_eq!(conn.location().database, "shard1");
        assert!(conn.mapping().range.contains(&150));
        conn.close().await.unwrap();

        assert!(matches!(
            f.resolver.connect_for_key(&250).await,
            Err(Error::MappingNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_with_connection_releases_connection() {
        let f = fixture(3).await;
        let inserted = f
            .resolver
            .with_connection(&42, |conn| {
                Box::pin(async move { conn.execute("INSERT INTO Tenants VALUES (42, 'x')").await })
            })
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let failed: Result<u64> = f
            .resolver
            .with_connection(&42, |conn| {
                Box::pin(async move { conn.execute("UPDATE Tenants").await })
            })
            .await;
        assert!(matches!(failed, Err(Error::Query(_))));
        assert_eq!(f.connector.closed_connections(), f.connector.opened_connections());

        let rows = f
            .resolver
            .with_connection(&7, |conn| {
                Box::pin(async move { conn.query("SELECT * FROM Tenants").await })
            })
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(42), Value::from("x")]]);
        assert_eq!(f.connector.opened_connections(), 3);
        assert_eq!(f.connector.closed_connections(), 3);
    }

    #[tokio::test]
    async fn test_stale_version_is_revalidated() {
        let f = fixture(3).await;
        let (mapping, _) = f.resolver.cache().lookup(&10).unwrap();

        // Another writer cycles the mapping; the cached snapshot is now stale
        let offline = f.store.take_mapping_offline(MAP, &mapping).unwrap();
        f.store.bring_mapping_online(MAP, &offline).unwrap();

        let refreshes = f.resolver.cache().refresh_count();
        let mut conn = f.resolver.connect_for_key(&10).await.unwrap();
        assert_eq!(conn.mapping().version, mapping.version + 2);
        assert!(f.resolver.cache().refresh_count() > refreshes);
        conn.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mapping_surfaces_after_budget() {
        let f = fixture(3).await;
        let (mapping, _) = f.resolver.cache().lookup(&10).unwrap();
        f.store.take_mapping_offline(MAP, &mapping).unwrap();

        assert!(matches!(
            f.resolver.connect_for_key(&10).await,
            Err(Error::MappingOffline { .. })
        ));
        assert_eq!(f.connector.closed_connections(), f.connector.opened_connections());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_mapping_to_come_back() {
        let f = fixture(6).await;
        let (mapping, _) = f.resolver.cache().lookup(&10).unwrap();
        let offline = f.store.take_mapping_offline(MAP, &mapping).unwrap();

        let store = Arc::clone(&f.store);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.bring_mapping_online(MAP, &offline).unwrap();
        });

        let mut conn = f.resolver.connect_for_key(&10).await.unwrap();
        assert!(conn.mapping().is_online());
        conn.close().await.unwrap();
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_shard_is_refused() {
        let f = fixture(2).await;
        let (_, shard) = f.resolver.cache().lookup(&10).unwrap();
        f.store
            .set_shard_status(MAP, &shard, ShardStatus::Offline)
            .unwrap();

        // The cached snapshot still shows the shard as active
        assert!(f.resolver.cache().snapshot().unwrap().shard(shard.id).unwrap().is_active());
        assert!(matches!(
            f.resolver.connect_for_key(&10).await,
            Err(Error::ShardOffline { .. })
        ));
        assert_eq!(f.connector.closed_connections(), f.connector.opened_connections());
        // The other shard is unaffected
        let mut conn = f.resolver.connect_for_key(&110).await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_version_change_is_revalidated() {
        let f = fixture(3).await;
        let (_, shard) = f.resolver.cache().lookup(&10).unwrap();

        // Offline and back: same status, newer row
        let offline = f
            .store
            .set_shard_status(MAP, &shard, ShardStatus::Offline)
            .unwrap();
        let online = f
            .store
            .set_shard_status(MAP, &offline, ShardStatus::Active)
            .unwrap();

        let mut conn = f.resolver.connect_for_key(&10).await.unwrap();
        assert_eq!(conn.shard().version, online.version);
        assert_eq!(f.connector.opened_connections(), 2);
        conn.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_is_retried_then_reported() {
        let f = fixture(3).await;
        f.connector.set_unreachable("localhost", true);
        assert!(matches!(
            f.resolver.connect_for_key(&10).await,
            Err(Error::Connection(_))
        ));
        assert_eq!(f.connector.opened_connections(), 0);
    }
}
