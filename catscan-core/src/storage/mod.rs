//! Partitioned entity storage with optimistic concurrency.
//!
//! Rows live in named tables and are addressed by `(partition_key,
//! row_key)`. Every write assigns a fresh `version`; replaces and deletes
//! only apply when the caller presents the version it read.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;
pub mod scans;

pub use memory::InMemoryEntityStore;
#[cfg(feature = "database")]
pub use postgres::PostgresEntityStore;
pub use scans::{CatalogScanStorage, leaf_table, page_table};

#[derive(Clone, Debug, PartialEq)]
pub struct EntityRow {
    pub partition_key: String,
    pub row_key: String,
    pub version: u64,
    pub body: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(u64),
    AlreadyExists,
}

/// Result of a version-checked replace or delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied; carries the new version (the deleted version for deletes).
    Written(u64),
    /// The row exists with a different version.
    Conflict,
    /// The row does not exist.
    Missing,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        matches!(self, WriteOutcome::Written(_))
    }
}

/// Abstracts the entity store backend consumed by the scan engine.
#[async_trait]
pub trait EntityStore: Send + Sync + fmt::Debug {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<EntityRow>>;

    /// All rows of one partition ordered by row key.
    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<EntityRow>>;

    /// Rows whose partition key starts with `prefix`, ordered by partition
    /// then row key. `limit` stops the scan early, which is how lower-bound
    /// counts are answered without reading every row.
    async fn query_prefix(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EntityRow>>;

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        body: serde_json::Value,
    ) -> Result<InsertOutcome>;

    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_version: u64,
        body: serde_json::Value,
    ) -> Result<WriteOutcome>;

    /// Deletes a row. `expected_version` of `None` deletes unconditionally.
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome>;

    /// Drops every row of a table. Missing tables are not an error.
    async fn delete_table(&self, table: &str) -> Result<()>;
}
