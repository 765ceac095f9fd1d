//! Shard map manager facade
//!
//! Owns the manager store, the mapping cache and the components built on
//! it. Topology mutations are retried with backoff when they fail with a
//! retryable error, re-reading the current state on every attempt.

use crate::lifecycle::{ShardLifecycleManager, orphaned};
use futures::future::BoxFuture;
use serde::Serialize;
use shardmap_client::Connector;
use shardmap_common::{
    Config, Error, Mapping, Range, Result, Shard, ShardKey, ShardLocation, ShardMapInfo,
};
use shardmap_query::{MultiShardQuery, MultiShardQueryExecutor, MultiShardResult, QueryPolicy};
use shardmap_routing::{MappingCache, RoutingResolver, ScopedConnection, retry_with_backoff};
use shardmap_store::ShardMapStore;
use std::ops::Add;
use std::sync::Arc;
use tracing::{info, warn};

/// A shard with the ranges mapped to it
#[derive(Clone, Debug, Serialize)]
pub struct ShardSummary<K> {
    pub shard: Shard,
    pub mappings: Vec<Mapping<K>>,
}

/// Entry point for one shard map
pub struct ShardMapManager<K> {
    config: Config,
    store: Arc<ShardMapStore>,
    connector: Arc<dyn Connector>,
    cache: Arc<MappingCache<K>>,
    resolver: RoutingResolver<K>,
    executor: MultiShardQueryExecutor<K>,
    lifecycle: ShardLifecycleManager<K>,
}

impl<K: ShardKey> ShardMapManager<K> {
    /// Attach to an existing manager store. Returns `None` if the store file
    /// does not exist or was never initialized.
    pub fn attach(config: Config, connector: Arc<dyn Connector>) -> Result<Option<Self>> {
        let path = &config.manager.store_path;
        if !ShardMapStore::exists(path) {
            return Ok(None);
        }
        let store = ShardMapStore::open(path)?;
        if !store.is_initialized()? {
            return Ok(None);
        }
        Ok(Some(Self::build(config, Arc::new(store), connector)))
    }

    /// Create the manager store if needed and mark it initialized
    pub fn initialize(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        let store = ShardMapStore::open(&config.manager.store_path)?;
        store.initialize()?;
        info!(
            "Shard map manager store ready at {}",
            config.manager.store_path.display()
        );
        Ok(Self::build(config, Arc::new(store), connector))
    }

    /// Attach to the manager store, creating and initializing it first when
    /// `create` is set
    pub fn initialize_or_attach(
        config: Config,
        connector: Arc<dyn Connector>,
        create: bool,
    ) -> Result<Option<Self>> {
        if create {
            Self::initialize(config, connector).map(Some)
        } else {
            Self::attach(config, connector)
        }
    }

    fn build(config: Config, store: Arc<ShardMapStore>, connector: Arc<dyn Connector>) -> Self {
        let cache = Arc::new(MappingCache::new(
            Arc::clone(&store),
            config.manager.shard_map_name.clone(),
        ));
        let resolver =
            RoutingResolver::new(Arc::clone(&cache), Arc::clone(&connector), config.routing.clone());
        let executor = MultiShardQueryExecutor::new(Arc::clone(&cache), Arc::clone(&connector));
        let lifecycle = ShardLifecycleManager::new(
            Arc::clone(&cache),
            Arc::clone(&connector),
            config.manager.server.clone(),
            config.shards.clone(),
        );
        Self {
            config,
            store,
            connector,
            cache,
            resolver,
            executor,
            lifecycle,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn map_name(&self) -> &str {
        &self.config.manager.shard_map_name
    }

    /// The configured shard map, if it was created
    pub fn shard_map(&self) -> Result<Option<ShardMapInfo>> {
        self.store.get_shard_map(self.map_name())
    }

    /// Get or create the configured shard map and register its schema info
    pub fn create_shard_map(&self) -> Result<ShardMapInfo> {
        let info = self.store.get_or_create_shard_map::<K>(self.map_name())?;
        self.store
            .put_schema_info(self.map_name(), &self.config.schema.to_schema_info())?;
        self.cache.invalidate();
        Ok(info)
    }

    /// Create the shard map and, if it has no shards yet, one shard per range
    pub async fn create_shard_map_with_ranges(
        &self,
        ranges: Vec<Range<K>>,
    ) -> Result<Vec<ShardSummary<K>>> {
        self.create_shard_map()?;
        if self.store.get_shards(self.map_name())?.is_empty() {
            for range in ranges {
                self.create_shard(range).await?;
            }
        } else {
            info!("Shard map '{}' already has shards", self.map_name());
        }
        self.list_shards_with_mappings()
    }

    /// Map `range` to a new or empty shard, without a contiguity check
    pub async fn create_shard(&self, range: Range<K>) -> Result<(Shard, Mapping<K>)> {
        let lifecycle = &self.lifecycle;
        let range = &range;
        retry_with_backoff(&self.config.retry, "create_shard", move || {
            lifecycle.create_shard(range.clone())
        })
        .await
    }

    /// Extend coverage with `range`, which must start at the current
    /// maximum high key
    pub async fn add_shard(&self, range: Range<K>) -> Result<(Shard, Mapping<K>)> {
        let lifecycle = &self.lifecycle;
        let range = &range;
        retry_with_backoff(&self.config.retry, "add_shard", move || {
            lifecycle.extend(range.clone())
        })
        .await
    }

    /// Extend coverage from the current maximum high key up to `new_high`
    pub async fn extend_coverage(&self, new_high: K) -> Result<(Shard, Mapping<K>)> {
        let low = self.current_max_high()?.ok_or_else(|| {
            Error::InvalidRange(format!(
                "shard map '{}' has no mappings to extend",
                self.map_name()
            ))
        })?;
        self.add_shard(Range::new(low, new_high)?).await
    }

    /// Upper bound of the current coverage, `None` if nothing is mapped.
    /// Fails if the top range is unbounded.
    pub fn current_max_high(&self) -> Result<Option<K>> {
        let snapshot = self.cache.refresh()?;
        let Some(top) = snapshot.top_mapping() else {
            return Ok(None);
        };
        top.range.high().cloned().map(Some).ok_or_else(|| Error::ContiguityViolation {
            expected: format!("no extension past unbounded range {}", top.range),
            actual: top.range.low().to_string(),
        })
    }

    /// Return an empty shard, provisioning one if none is registered
    pub async fn add_empty_shard(&self) -> Result<Shard> {
        let lifecycle = &self.lifecycle;
        retry_with_backoff(&self.config.retry, "add_empty_shard", move || {
            lifecycle.create_or_get_empty_shard()
        })
        .await
    }

    /// Open a connection to the shard that owns `key`
    pub async fn route_by_key(&self, key: &K) -> Result<ScopedConnection<K>> {
        self.resolver.connect_for_key(key).await
    }

    /// Run `op` on the shard that owns `key`; the connection is closed
    /// afterwards
    pub async fn with_shard_for_key<T, F>(&self, key: &K, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedConnection<K>) -> BoxFuture<'c, Result<T>>,
    {
        self.resolver.with_connection(key, op).await
    }

    /// Query policy built from the configured defaults
    #[must_use]
    pub fn default_query_policy(&self) -> QueryPolicy {
        QueryPolicy::from(&self.config.query)
    }

    pub async fn run_multi_shard_query(
        &self,
        query: &MultiShardQuery,
        policy: &QueryPolicy,
    ) -> Result<MultiShardResult> {
        self.executor.execute(query, policy).await
    }

    pub fn find_empty_shards(&self) -> Result<Vec<Shard>> {
        self.lifecycle.find_empty_shards()
    }

    /// Drop a shard without mappings and its store. The metadata change and
    /// the store drop are retried separately; a store that cannot be dropped
    /// after its shard was unregistered is reported as `OrphanedStore`.
    pub async fn drop_shard(&self, shard: &Shard) -> Result<()> {
        let lifecycle = &self.lifecycle;
        let store = &self.store;
        let map = self.map_name();
        let id = shard.id;
        let removed = retry_with_backoff(&self.config.retry, "unregister_shard", move || async move {
            let current = store
                .get_shard(map, id)?
                .ok_or(Error::ShardNotFound(id))?;
            lifecycle.unregister_shard(&current)?;
            Ok::<_, Error>(current)
        })
        .await?;
        self.destroy_store(&removed.location).await
    }

    /// Drop every shard without mappings. Shards that gained a mapping or
    /// disappeared since the scan are skipped.
    pub async fn drop_empty_shards(&self) -> Result<Vec<Shard>> {
        let mut dropped = Vec::new();
        for shard in self.lifecycle.find_empty_shards()? {
            match self.drop_shard(&shard).await {
                Ok(()) => dropped.push(shard),
                Err(e @ (Error::ShardNotEmpty { .. } | Error::ShardNotFound(_))) => {
                    info!("Skipping shard {}: {}", shard.location, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dropped)
    }

    async fn destroy_store(&self, location: &ShardLocation) -> Result<()> {
        let lifecycle = &self.lifecycle;
        retry_with_backoff(&self.config.retry, "drop_store", move || {
            lifecycle.destroy_store(location)
        })
        .await
        .map_err(|e| orphaned(location, &e))
    }

    /// Every shard with its mappings, ordered by database then server
    pub fn list_shards_with_mappings(&self) -> Result<Vec<ShardSummary<K>>> {
        let snapshot = self.cache.refresh()?;
        let mut summaries: Vec<_> = snapshot
            .shards
            .iter()
            .map(|shard| ShardSummary {
                shard: shard.clone(),
                mappings: snapshot.mappings_for(shard.id).cloned().collect(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            let (a, b) = (&a.shard.location, &b.shard.location);
            a.database
                .cmp(&b.database)
                .then_with(|| a.server.cmp(&b.server))
        });
        Ok(summaries)
    }

    /// Whether the manager server answers
    pub async fn check_connectivity(&self) -> bool {
        let reachable = self.connector.ping(&self.config.manager.server).await;
        if !reachable {
            warn!("Server {} is unreachable", self.config.manager.server);
        }
        reachable
    }

    /// Drop every shard store, clear the manager store and delete its file
    pub async fn drop_all_and_teardown(self) -> Result<()> {
        match self.lifecycle.drop_all().await {
            Ok(()) | Err(Error::ShardMapNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.clear()?;

        let path = self.store.path().to_path_buf();
        let Self {
            store,
            cache,
            resolver,
            executor,
            lifecycle,
            ..
        } = self;
        drop((resolver, executor, lifecycle, cache, store));

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        info!("Removed shard map manager store {}", path.display());
        Ok(())
    }
}

impl<K> ShardMapManager<K>
where
    K: ShardKey + From<i32> + Add<Output = K>,
{
    /// Create the shard map with the configured initial ranges, e.g.
    /// `[0, 100)` and `[100, 200)`
    pub async fn create_starter_layout(&self) -> Result<Vec<ShardSummary<K>>> {
        let bounds = &self.config.shards.initial_boundaries;
        let ranges = bounds
            .windows(2)
            .map(|w| Range::new(K::from(w[0]), K::from(w[1])))
            .collect::<Result<Vec<_>>>()?;
        self.create_shard_map_with_ranges(ranges).await
    }

    /// Suggested high key for the next range: current maximum high plus the
    /// configured range width
    pub fn default_next_high(&self) -> Result<K> {
        let width = K::from(self.config.shards.default_range_width);
        Ok(self.current_max_high()?.unwrap_or_else(|| K::from(0)) + width)
    }
}
