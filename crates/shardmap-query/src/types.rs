//! Multi-shard query request and result types.

use serde::Serialize;
use shardmap_client::{Row, Statement};
use shardmap_common::{FailurePolicy, QueryConfig, ShardFailure, ShardId, ShardLocation};
use std::time::Duration;

/// A statement to run on every shard
#[derive(Clone, Debug)]
pub struct MultiShardQuery {
    pub text: String,
    /// Table the statement reads, when it differs from what the text names.
    /// Rows of reference tables are deduplicated.
    pub table: Option<String>,
}

impl MultiShardQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            table: None,
        }
    }

    /// `SELECT * FROM <table>`, tagged with the table
    pub fn select_all(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            text: format!("SELECT * FROM {table}"),
            table: Some(table),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Table the statement reads: the explicit tag, else the table the text
    /// names. `None` when the text does not parse.
    #[must_use]
    pub fn target_table(&self) -> Option<String> {
        self.table.clone().or_else(|| {
            Statement::parse(&self.text)
                .ok()
                .map(|statement| statement.table().to_string())
        })
    }
}

/// Fan-out limits and failure handling
#[derive(Clone, Debug)]
pub struct QueryPolicy {
    /// Budget for one shard, covering connect and query
    pub per_shard_timeout: Duration,
    pub max_parallelism: usize,
    pub on_shard_failure: FailurePolicy,
}

impl From<&QueryConfig> for QueryPolicy {
    fn from(config: &QueryConfig) -> Self {
        Self {
            per_shard_timeout: config.per_shard_timeout(),
            max_parallelism: config.max_parallelism,
            on_shard_failure: config.on_shard_failure,
        }
    }
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::from(&QueryConfig::default())
    }
}

/// A row tagged with the shard that produced it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShardRow {
    pub shard_id: ShardId,
    pub location: ShardLocation,
    pub values: Row,
}

/// Merged result of a multi-shard query
#[derive(Clone, Debug, Default, Serialize)]
pub struct MultiShardResult {
    pub rows: Vec<ShardRow>,
    /// Shards that failed or timed out and were skipped
    pub failures: Vec<ShardFailure>,
    /// Shards in the snapshot the query ran against
    pub shard_count: usize,
}

impl MultiShardResult {
    /// Whether some shards are missing from the result
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Row values without shard tags
    pub fn values(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter().map(|r| &r.values)
    }
}
