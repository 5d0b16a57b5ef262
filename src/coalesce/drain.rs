//! Pending Write Drain
//!
//! Buffered mutations waiting to reach the remote store. A drain
//! writes each pending row's current merged state from the snapshot;
//! keys that fail stay pending for the next trigger.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::remote::RemoteStore;
use crate::row::{Row, RowKey};
use crate::snapshot::SharedSnapshot;

/// A buffered mutation
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Row the mutation targets
    pub key: RowKey,
    /// Latest payload queued for the row
    pub payload: Row,
    /// When it was queued
    pub queued_at: Instant,
    /// Bumped on every re-queue of the same key
    generation: u64,
}

/// Pending set plus the logic that flushes it
pub struct PendingWriteDrain {
    /// Remote table
    table: String,
    /// Field that identifies a row
    index_name: String,
    /// Remote store client
    remote: Arc<dyn RemoteStore>,
    /// Snapshot the merged row state is read from
    snapshot: SharedSnapshot,
    /// Pending mutations by key
    pending: RwLock<HashMap<RowKey, PendingMutation>>,
    /// Generation counter for re-queues
    generation: RwLock<u64>,
    /// Serializes drains
    flush_lock: Mutex<()>,
}

impl PendingWriteDrain {
    /// Create an empty drain
    pub fn new(
        table: String,
        index_name: String,
        remote: Arc<dyn RemoteStore>,
        snapshot: SharedSnapshot,
    ) -> Self {
        Self {
            table,
            index_name,
            remote,
            snapshot,
            pending: RwLock::new(HashMap::new()),
            generation: RwLock::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    /// Queue a mutation, replacing any earlier one for the same key
    pub async fn queue(&self, key: RowKey, payload: Row) {
        let generation = {
            let mut generation = self.generation.write().await;
            *generation += 1;
            *generation
        };

        let mutation = PendingMutation {
            key: key.clone(),
            payload,
            queued_at: Instant::now(),
            generation,
        };
        if self.pending.write().await.insert(key.clone(), mutation).is_some() {
            tracing::debug!("Pending write for {} superseded", key);
        } else {
            tracing::debug!("Write for {} buffered", key);
        }
    }

    /// Forget a pending mutation, returning whether one existed
    pub async fn discard(&self, key: &RowKey) -> bool {
        self.pending.write().await.remove(key).is_some()
    }

    /// Whether `key` has a pending mutation
    pub async fn is_pending(&self, key: &RowKey) -> bool {
        self.pending.read().await.contains_key(key)
    }

    /// Pending keys, sorted
    pub async fn pending_keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<_> = self.pending.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the pending set
    pub async fn pending(&self) -> Vec<PendingMutation> {
        let mut mutations: Vec<_> = self.pending.read().await.values().cloned().collect();
        mutations.sort_by_key(|m| m.queued_at);
        mutations
    }

    /// Queue time of the oldest pending mutation
    pub async fn oldest_queued_at(&self) -> Option<Instant> {
        self.pending.read().await.values().map(|m| m.queued_at).min()
    }

    /// Flush every pending mutation. Returns the keys written.
    pub async fn flush_all(&self) -> Vec<RowKey> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<(RowKey, u64)> = self
            .pending()
            .await
            .into_iter()
            .map(|m| (m.key, m.generation))
            .collect();

        if batch.is_empty() {
            return Vec::new();
        }

        tracing::info!("Draining {} pending writes for {}", batch.len(), self.table);

        let mut flushed = Vec::with_capacity(batch.len());
        let mut failed = 0usize;

        for (key, generation) in batch {
            let payload = self
                .snapshot
                .read()
                .await
                .find(&key)
                .map(|row| row.without(&self.index_name));

            let Some(payload) = payload else {
                tracing::warn!("Row {} left the snapshot, dropping its pending write", key);
                self.settle(&key, generation).await;
                continue;
            };

            if payload.is_empty() {
                self.settle(&key, generation).await;
                flushed.push(key);
                continue;
            }

            match self.remote.update(&self.table, &key, payload).await {
                Ok(()) => {
                    self.settle(&key, generation).await;
                    flushed.push(key);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Drain of {} failed, keeping it pending: {}", key, e);
                }
            }
        }

        tracing::info!(
            "Drain complete for {}: flushed={}, failed={}",
            self.table,
            flushed.len(),
            failed
        );
        flushed
    }

    /// Remove `key` unless it was re-queued after `generation`
    async fn settle(&self, key: &RowKey, generation: u64) {
        let mut pending = self.pending.write().await;
        if pending.get(key).map(|m| m.generation) == Some(generation) {
            pending.remove(key);
        } else {
            tracing::debug!("{} re-queued during drain, keeping it pending", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::snapshot::Snapshot;

    fn row(id: i64, text: &str) -> Row {
        Row::new().with("id", id).with("text", text)
    }

    async fn setup(rows: Vec<Row>) -> (Arc<MemoryRemote>, SharedSnapshot, PendingWriteDrain) {
        let remote = Arc::new(MemoryRemote::new("id"));
        remote.seed("todos", rows.clone()).await;

        let snapshot = Snapshot::new("id").shared();
        snapshot.write().await.replace_all(rows);

        let drain = PendingWriteDrain::new(
            "todos".into(),
            "id".into(),
            remote.clone(),
            snapshot.clone(),
        );
        (remote, snapshot, drain)
    }

    #[tokio::test]
    async fn test_flush_writes_merged_state_without_key() {
        let (remote, snapshot, drain) = setup(vec![row(1, "a").with("done", false)]).await;

        snapshot
            .write()
            .await
            .merge(&RowKey::from(1), &Row::new().with("text", "b"));
        drain.queue(RowKey::from(1), Row::new().with("text", "b")).await;

        let flushed = drain.flush_all().await;
        assert_eq!(flushed, vec![RowKey::from(1)]);
        assert_eq!(
            remote.updates().await,
            vec![(RowKey::from(1), Row::new().with("text", "b").with("done", false))]
        );
        assert!(drain.pending_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_replaces_payload() {
        let (_remote, _snapshot, drain) = setup(vec![row(1, "a")]).await;

        drain.queue(RowKey::from(1), Row::new().with("text", "b")).await;
        drain.queue(RowKey::from(1), Row::new().with("text", "c")).await;

        let pending = drain.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, Row::new().with("text", "c"));
    }

    #[tokio::test]
    async fn test_failed_keys_stay_pending() {
        let (remote, _snapshot, drain) = setup(vec![row(1, "a"), row(2, "b")]).await;
        drain.queue(RowKey::from(1), Row::new().with("text", "a")).await;
        drain.queue(RowKey::from(2), Row::new().with("text", "b")).await;

        remote.reject_key(RowKey::from(2)).await;
        let flushed = drain.flush_all().await;
        assert_eq!(flushed, vec![RowKey::from(1)]);
        assert_eq!(drain.pending_keys().await, vec![RowKey::from(2)]);

        // Retried on the next trigger
        remote.accept_key(&RowKey::from(2)).await;
        assert_eq!(drain.flush_all().await, vec![RowKey::from(2)]);
        assert!(drain.pending_keys().await.is_empty());
        assert_eq!(remote.updates().await.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_row_dropped() {
        let (remote, snapshot, drain) = setup(vec![row(1, "a")]).await;
        drain.queue(RowKey::from(1), Row::new().with("text", "b")).await;
        snapshot.write().await.remove_by_key(&RowKey::from(1));

        assert!(drain.flush_all().await.is_empty());
        assert!(drain.pending_keys().await.is_empty());
        assert!(remote.updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_during_flush_survives() {
        let (_remote, _snapshot, drain) = setup(vec![row(1, "a")]).await;
        drain.queue(RowKey::from(1), Row::new().with("text", "a")).await;
        let stale = drain.pending().await[0].generation;

        drain.queue(RowKey::from(1), Row::new().with("text", "b")).await;
        drain.settle(&RowKey::from(1), stale).await;
        assert!(drain.is_pending(&RowKey::from(1)).await);
    }

    #[tokio::test]
    async fn test_discard() {
        let (_remote, _snapshot, drain) = setup(vec![row(1, "a")]).await;
        drain.queue(RowKey::from(1), Row::new().with("text", "b")).await;
        assert!(drain.discard(&RowKey::from(1)).await);
        assert!(!drain.discard(&RowKey::from(1)).await);
        assert!(drain.oldest_queued_at().await.is_none());
    }
}
