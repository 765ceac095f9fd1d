//! Shardmap Common - Shared types and utilities
//!
//! This crate provides the shard map data model, the error taxonomy and the
//! configuration bundle used across all shardmap components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, FailurePolicy, QueryConfig, RetryConfig};
pub use error::{Error, Result};
pub use types::*;
