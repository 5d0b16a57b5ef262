//! In-Memory Remote Store
//!
//! A process-local stand-in for the remote table. Every successful
//! write is published on a change stream, the way a database with
//! logical replication would, so [`MemoryFeed`] subscribers see it.

use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};

use super::RemoteStore;
use crate::error::{Error, Result};
use crate::feed::{ChangeEvent, MemoryFeed, TableChange};
use crate::row::{Row, RowKey};

/// Capacity of the change stream
const CHANGE_STREAM_CAPACITY: usize = 1024;

/// A call made against the remote store
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Select { table: String },
    Insert { table: String, row: Row },
    Update { table: String, key: RowKey, row: Row },
    Delete { table: String, key: RowKey },
}

/// In-memory remote store
pub struct MemoryRemote {
    /// Field that identifies a row
    index_name: String,
    /// Table contents
    tables: RwLock<HashMap<String, Vec<Row>>>,
    /// Every call made, in order
    calls: RwLock<Vec<RemoteCall>>,
    /// Reject all writes while set
    unavailable: RwLock<bool>,
    /// Keys whose writes are rejected
    rejected_keys: RwLock<HashSet<RowKey>>,
    /// Change stream
    changes: broadcast::Sender<TableChange>,
}

impl MemoryRemote {
    /// Create an empty remote keyed by `index_name`
    pub fn new(index_name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            index_name: index_name.into(),
            tables: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            unavailable: RwLock::new(false),
            rejected_keys: RwLock::new(HashSet::new()),
            changes,
        }
    }

    /// Seed a table without recording calls or publishing changes
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables.write().await.insert(table.to_string(), rows);
    }

    /// A change feed following `table`
    pub fn feed(&self, table: &str) -> MemoryFeed {
        MemoryFeed::new(table, self.changes.clone())
    }

    /// Simulate an outage: every write fails while set
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    /// Reject writes for a single key
    pub async fn reject_key(&self, key: RowKey) {
        self.rejected_keys.write().await.insert(key);
    }

    /// Accept writes for a previously rejected key
    pub async fn accept_key(&self, key: &RowKey) {
        self.rejected_keys.write().await.remove(key);
    }

    /// All calls made so far
    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.calls.read().await.clone()
    }

    /// Update calls made so far, as (key, payload)
    pub async fn updates(&self) -> Vec<(RowKey, Row)> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                RemoteCall::Update { key, row, .. } => Some((key.clone(), row.clone())),
                _ => None,
            })
            .collect()
    }

    /// Current contents of a table
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    async fn record(&self, call: RemoteCall) {
        self.calls.write().await.push(call);
    }

    async fn check_writable(&self, table: &str, key: Option<&RowKey>) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(Error::RemoteUnavailable(format!("table {} is unreachable", table)));
        }
        if let Some(key) = key {
            if self.rejected_keys.read().await.contains(key) {
                return Err(Error::Remote {
                    table: table.to_string(),
                    reason: format!("write to {} rejected", key),
                });
            }
        }
        Ok(())
    }

    fn publish(&self, table: &str, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(TableChange {
            table: table.to_string(),
            event,
        });
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: &str) -> Result<Vec<Row>> {
        self.record(RemoteCall::Select { table: table.to_string() }).await;
        if *self.unavailable.read().await {
            return Err(Error::RemoteUnavailable(format!("table {} is unreachable", table)));
        }
        Ok(self.rows(table).await)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<()> {
        self.record(RemoteCall::Insert {
            table: table.to_string(),
            row: row.clone(),
        })
        .await;

        let key = row.key(&self.index_name).ok_or_else(|| Error::Remote {
            table: table.to_string(),
            reason: format!("missing '{}'", self.index_name),
        })?;
        self.check_writable(table, Some(&key)).await?;

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| r.key(&self.index_name).as_ref() == Some(&key)) {
            return Err(Error::Remote {
                table: table.to_string(),
                reason: format!("duplicate key {}", key),
            });
        }
        rows.push(row.clone());
        drop(tables);

        self.publish(table, ChangeEvent::Insert { new: row });
        Ok(())
    }

    async fn update(&self, table: &str, key: &RowKey, row: Row) -> Result<()> {
        self.record(RemoteCall::Update {
            table: table.to_string(),
            key: key.clone(),
            row: row.clone(),
        })
        .await;
        self.check_writable(table, Some(key)).await?;

        let mut tables = self.tables.write().await;
        let Some(existing) = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.key(&self.index_name).as_ref() == Some(key)))
        else {
            // Updating zero rows is not an error
            return Ok(());
        };

        let old = existing.clone();
        existing.merge(&row);
        let new = existing.clone();
        drop(tables);

        self.publish(table, ChangeEvent::Update { old, new });
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<()> {
        self.record(RemoteCall::Delete {
            table: table.to_string(),
            key: key.clone(),
        })
        .await;
        self.check_writable(table, Some(key)).await?;

        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(());
        };
        let Some(pos) = rows.iter().position(|r| r.key(&self.index_name).as_ref() == Some(key)) else {
            return Ok(());
        };
        let old = rows.remove(pos);
        drop(tables);

        self.publish(table, ChangeEvent::Delete { old });
        Ok(())
    }
}
