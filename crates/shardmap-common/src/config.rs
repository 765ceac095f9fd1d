//! Configuration types for shardmap
//!
//! The configuration bundle carries no behavior of its own: where the shard
//! map manager store lives, how new shards are named, credentials for
//! connectors, and the retry and fan-out defaults.

use crate::error::{Error, Result};
use crate::types::SchemaInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for shardmap
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shard map manager store
    pub manager: ManagerConfig,
    /// Shard provisioning
    pub shards: ShardsConfig,
    /// Credentials passed to the connector
    pub credentials: Credentials,
    /// Table layout registered with a new shard map
    pub schema: SchemaConfig,
    /// Backoff for topology mutations
    pub retry: RetryConfig,
    /// Backoff for data-dependent routing
    pub routing: RetryConfig,
    /// Multi-shard query defaults
    pub query: QueryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Shard map manager store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Server hosting the manager store and new shards
    pub server: String,
    /// Path of the manager store file
    pub store_path: PathBuf,
    /// Name of the shard map to create or attach to
    pub shard_map_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            store_path: PathBuf::from("./shardmap-data/manager.redb"),
            shard_map_name: "CustomerIDShardMap".to_string(),
        }
    }
}

/// Shard provisioning configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    /// Database name pattern for new shards. `{map}` expands to the shard
    /// map name and `{index}` to the first unused shard number.
    pub name_format: String,
    /// Boundaries of the initial ranges, e.g. `[0, 100, 200]` creates
    /// `[0, 100)` and `[100, 200)`
    pub initial_boundaries: Vec<i32>,
    /// Width of a new range when extending coverage without an explicit high key
    pub default_range_width: i32,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            name_format: "{map}_shard{index}".to_string(),
            initial_boundaries: vec![0, 100, 200],
            default_range_width: 100,
        }
    }
}

impl ShardsConfig {
    /// Expand the name format for a shard number
    #[must_use]
    pub fn database_name(&self, map: &str, index: usize) -> String {
        self.name_format
            .replace("{map}", map)
            .replace("{index}", &index.to_string())
    }
}

/// Opaque credentials for connectors that authenticate. The bundled
/// connectors need none, so this section is only loaded and stored.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Table layout registered as schema info for a new shard map
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Tables replicated on every shard
    pub reference_tables: Vec<String>,
    /// Tables partitioned by key column
    pub sharded_tables: Vec<ShardedTableConfig>,
}

/// One sharded table and its key column
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardedTableConfig {
    pub name: String,
    pub key_column: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            reference_tables: vec!["Regions".to_string()],
            sharded_tables: vec![
                ShardedTableConfig {
                    name: "Tenants".to_string(),
                    key_column: "TenantId".to_string(),
                },
                ShardedTableConfig {
                    name: "Things".to_string(),
                    key_column: "TenantId".to_string(),
                },
            ],
        }
    }
}

impl SchemaConfig {
    /// Build the schema info registered with the shard map
    #[must_use]
    pub fn to_schema_info(&self) -> SchemaInfo {
        let mut schema = SchemaInfo::new();
        for name in &self.reference_tables {
            schema.add_reference(name.as_str());
        }
        for table in &self.sharded_tables {
            schema.add_sharded(table.name.as_str(), table.key_column.as_str());
        }
        schema
    }
}

/// Bounded exponential backoff
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 20,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Behavior of a multi-shard query when a shard fails or times out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Cancel every other shard and fail the whole query
    AbortAll,
    /// Skip the failed shards and annotate the result
    #[default]
    PartialResults,
}

/// Multi-shard query defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Timeout for a single shard, covering connect and query
    pub per_shard_timeout_ms: u64,
    /// Maximum number of shards queried at once
    pub max_parallelism: usize,
    pub on_shard_failure: FailurePolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            per_shard_timeout_ms: 30_000,
            max_parallelism: 32,
            on_shard_failure: FailurePolicy::PartialResults,
        }
    }
}

impl QueryConfig {
    #[must_use]
    pub const fn per_shard_timeout(&self) -> Duration {
        Duration::from_millis(self.per_shard_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 70,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
        assert_eq!(retry.backoff(4), Duration::from_millis(70));
        assert_eq!(retry.backoff(40), Duration::from_millis(70));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [manager]
            shard_map_name = "Orders"

            [query]
            on_shard_failure = "AbortAll"
            "#,
        )
        .unwrap();

        assert_eq!(config.manager.shard_map_name, "Orders");
        assert_eq!(config.manager.server, "localhost");
        assert_eq!(config.query.on_shard_failure, FailurePolicy::AbortAll);
        assert_eq!(config.query.max_parallelism, 32);
        assert_eq!(config.shards.initial_boundaries, vec![0, 100, 200]);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = Config::from_toml("manager = 3").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_shard_database_name() {
        let shards = ShardsConfig::default();
        assert_eq!(shards.database_name("Orders", 2), "Orders_shard2");
    }

    #[test]
    fn test_default_schema() {
        let schema = SchemaConfig::default().to_schema_info();
        assert!(schema.is_reference("Regions"));
        assert!(!schema.is_reference("Tenants"));
        assert!(schema.get("Things").is_some());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            user: "admin".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
