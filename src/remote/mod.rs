//! Remote Store Module
//!
//! The remote table is the source of truth for every write. This
//! module defines the client contract the mirror depends on.

mod memory;

pub use memory::{MemoryRemote, RemoteCall};

use crate::error::Result;
use crate::row::{Row, RowKey};

/// Client for the remote relational store.
///
/// Ordinary failures (network, validation) come back as `Err` values.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch every row of `table`
    async fn select(&self, table: &str) -> Result<Vec<Row>>;

    /// Insert a row
    async fn insert(&self, table: &str, row: Row) -> Result<()>;

    /// Apply a partial update to the row identified by `key`
    async fn update(&self, table: &str, key: &RowKey, row: Row) -> Result<()>;

    /// Delete the row identified by `key`
    async fn delete(&self, table: &str, key: &RowKey) -> Result<()>;
}
