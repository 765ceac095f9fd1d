//! Error types for shardmap
//!
//! One taxonomy is shared by the store, the router, the query executor and
//! the lifecycle manager so that callers can match on the failure kind
//! regardless of which layer raised it.

use crate::types::{MappingId, ShardFailure, ShardId};
use thiserror::Error;

/// Common result type for shardmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for shardmap
#[derive(Debug, Error)]
pub enum Error {
    // Versioning
    #[error(
        "concurrency conflict on {entity} {id}: expected version {expected}, found {}",
        found_version(.actual)
    )]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        actual: Option<u64>,
    },

    // Range validation
    #[error("range {range} overlaps mapping {mapping_id} {existing} on shard {shard_id}")]
    RangeOverlap {
        range: String,
        existing: String,
        mapping_id: MappingId,
        shard_id: ShardId,
    },

    #[error("range must start at {expected} to stay contiguous, got {actual}")]
    ContiguityViolation { expected: String, actual: String },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    // Routing
    #[error("no mapping contains key {key}")]
    MappingNotFound { key: String },

    #[error("mapping {mapping_id} {range} is offline")]
    MappingOffline { mapping_id: MappingId, range: String },

    #[error("shard {shard_id} at {location} is offline")]
    ShardOffline { shard_id: ShardId, location: String },

    // Setup
    #[error("shard map manager has not been initialized")]
    ShardMapManagerNotInitialized,

    #[error("shard map not found: {0}")]
    ShardMapNotFound(String),

    #[error("shard map already exists: {0}")]
    ShardMapAlreadyExists(String),

    #[error("shard map {map} uses key type {expected}, not {actual}")]
    KeyTypeMismatch {
        map: String,
        expected: String,
        actual: String,
    },

    // Shards
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("a shard is already registered at {0}")]
    ShardLocationExists(String),

    #[error("shard {shard_id} at {location} still holds {mappings} mapping(s)")]
    ShardNotEmpty {
        shard_id: ShardId,
        location: String,
        mappings: usize,
    },

    #[error("physical store {location} was provisioned but not registered: {reason}")]
    ProvisioningRollback { location: String, reason: String },

    #[error("shard was unregistered but its store {location} could not be dropped: {reason}")]
    OrphanedStore { location: String, reason: String },

    // Fan-out
    #[error("{} shard(s) failed: {}", .failed.len(), join_failures(.failed))]
    PartialFailure { failed: Vec<ShardFailure> },

    // Connectivity
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("operation timed out")]
    Timeout,

    // Internal
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn found_version(actual: &Option<u64>) -> String {
    actual.map_or_else(|| "none (row removed)".to_string(), |v| v.to_string())
}

fn join_failures(failed: &[ShardFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Check if this is a transient error worth retrying
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. }
                | Self::MappingOffline { .. }
                | Self::ShardOffline { .. }
                | Self::Timeout
                | Self::Connection(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MappingNotFound { .. } | Self::ShardMapNotFound(_) | Self::ShardNotFound(_)
        )
    }

    /// Check if the caller supplied something the shard map must refuse
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::RangeOverlap { .. }
                | Self::ContiguityViolation { .. }
                | Self::InvalidRange(_)
                | Self::ShardNotEmpty { .. }
                | Self::ShardLocationExists(_)
                | Self::KeyTypeMismatch { .. }
        )
    }

    /// Shards reported by a fan-out failure
    #[must_use]
    pub fn failed_shards(&self) -> &[ShardFailure] {
        match self {
            Self::PartialFailure { failed } => failed,
            _ => &[],
        }
    }
}
