//! Multi-shard fan-out
//!
//! ```text
//!              execute(query, policy)
//!                       │
//!        refresh snapshot, capture shards
//!                       │
//!        ┌──────────────┼──────────────┐       JoinSet, one task per shard,
//!        ▼              ▼              ▼       gated by Semaphore(max_parallelism)
//!   open+query     open+query     open+query   each under its own deadline
//!        │              │              │
//!        └──────────────┼──────────────┘
//!                       ▼
//!      merge in completion order, apply failure policy,
//!      deduplicate reference-table rows
//! ```
//!
//! Dropping the `execute` future drops the `JoinSet`, which aborts every
//! shard task still in flight. An aborted task cannot run its close, so its
//! connection is released by the connection's destructor.

use crate::types::{MultiShardQuery, MultiShardResult, QueryPolicy, ShardRow};
use shardmap_client::{Connector, Row};
use shardmap_common::{
    Error, FailurePolicy, Result, SchemaInfo, Shard, ShardFailure, ShardKey, ShardLocation,
};
use shardmap_routing::MappingCache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// Runs statements on every shard of a shard map
pub struct MultiShardQueryExecutor<K> {
    cache: Arc<MappingCache<K>>,
    connector: Arc<dyn Connector>,
}

impl<K: ShardKey> MultiShardQueryExecutor<K> {
    pub fn new(cache: Arc<MappingCache<K>>, connector: Arc<dyn Connector>) -> Self {
        Self { cache, connector }
    }

    /// Run `query` on every shard registered when the call starts
    pub async fn execute(
        &self,
        query: &MultiShardQuery,
        policy: &QueryPolicy,
    ) -> Result<MultiShardResult> {
        let snapshot = self.cache.refresh()?;
        let shard_count = snapshot.shards.len();
        let abort_all = policy.on_shard_failure == FailurePolicy::AbortAll;

        let mut failures = Vec::new();
        let mut targets = Vec::with_capacity(shard_count);
        for shard in &snapshot.shards {
            if shard.is_active() {
                targets.push(shard.clone());
            } else {
                failures.push(ShardFailure::new(shard, "shard offline"));
            }
        }
        if abort_all && !failures.is_empty() {
            return Err(Error::PartialFailure { failed: failures });
        }

        debug!(
            "Fanning out '{}' to {} shard(s), parallelism {}",
            query.text,
            targets.len(),
            policy.max_parallelism
        );

        let semaphore = Arc::new(Semaphore::new(policy.max_parallelism.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::with_capacity(targets.len());
        for shard in targets {
            let connector = Arc::clone(&self.connector);
            let semaphore = Arc::clone(&semaphore);
            let text = query.text.clone();
            let location = shard.location.clone();
            let per_shard_timeout = policy.per_shard_timeout;
            let handle = tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::query(e.to_string()))?;
                query_shard(connector.as_ref(), &location, &text, per_shard_timeout).await
            });
            pending.insert(handle.id(), shard);
        }

        let mut completed: Vec<(Shard, Vec<Row>)> = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => (e.id(), Err(Error::query(format!("shard task failed: {e}")))),
            };
            let Some(shard) = pending.remove(&id) else {
                continue;
            };

            match outcome {
                Ok(rows) => completed.push((shard, rows)),
                Err(e) => {
                    warn!("Shard {} failed: {}", shard.location, e);
                    failures.push(ShardFailure::new(&shard, e.to_string()));
                    if abort_all {
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        return Err(Error::PartialFailure { failed: failures });
                    }
                }
            }
        }

        if completed.is_empty() && !failures.is_empty() {
            return Err(Error::PartialFailure { failed: failures });
        }

        let table = query.target_table();
        let rows = if is_reference(snapshot.schema.as_ref(), table.as_deref()) {
            dedup_reference_rows(completed)
        } else {
            completed
                .into_iter()
                .flat_map(|(shard, rows)| tag_rows(shard, rows))
                .collect()
        };

        if failures.is_empty() {
            debug!("'{}' returned {} row(s)", query.text, rows.len());
        } else {
            info!(
                "'{}' returned {} row(s), {} of {} shard(s) failed",
                query.text,
                rows.len(),
                failures.len(),
                shard_count
            );
        }
        Ok(MultiShardResult {
            rows,
            failures,
            shard_count,
        })
    }
}

/// Open, query and close one shard under a single deadline
async fn query_shard(
    connector: &dyn Connector,
    location: &ShardLocation,
    text: &str,
    per_shard_timeout: Duration,
) -> Result<Vec<Row>> {
    let deadline = Instant::now() + per_shard_timeout;
    let mut conn = timeout_at(deadline, connector.open(location))
        .await
        .map_err(|_| Error::Timeout)??;

    let result = match timeout_at(deadline, conn.query(text)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    };
    if let Err(e) = conn.close().await {
        warn!("Failed to close connection to {}: {}", location, e);
    }
    result
}

fn is_reference(schema: Option<&SchemaInfo>, table: Option<&str>) -> bool {
    match (schema, table) {
        (Some(schema), Some(table)) => schema.is_reference(table),
        _ => false,
    }
}

fn tag_rows(shard: Shard, rows: Vec<Row>) -> impl Iterator<Item = ShardRow> {
    rows.into_iter().map(move |values| ShardRow {
        shard_id: shard.id,
        location: shard.location.clone(),
        values,
    })
}

/// Collapse copies of a replicated table. A row that appears `n` times on
/// the shard holding the most copies appears `n` times in the result; the
/// first occurrences are kept.
fn dedup_reference_rows(completed: Vec<(Shard, Vec<Row>)>) -> Vec<ShardRow> {
    let mut kept: HashMap<Row, usize> = HashMap::new();
    let mut rows = Vec::new();
    for (shard, values) in completed {
        let mut local: HashMap<Row, usize> = HashMap::new();
        for row in values {
            let seen = local.entry(row.clone()).or_default();
            *seen += 1;
            let emitted = kept.entry(row.clone()).or_default();
            if *seen > *emitted {
                *emitted = *seen;
                rows.push(ShardRow {
                    shard_id: shard.id,
                    location: shard.location.clone(),
                    values: row,
                });
            }
        }
    }
    rows
}
