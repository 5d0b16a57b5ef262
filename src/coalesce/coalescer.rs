//! Mutation Coalescer
//!
//! Inserts and deletes always go straight to the remote store. Updates
//! landing inside the coalescing window are applied locally, relayed to
//! peers and left for the drain; everything else writes through, after
//! draining whatever is already buffered.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::PendingWriteDrain;
use crate::broadcast::{send_with_retry, BroadcastChannel, BroadcastPayload, RetryPolicy};
use crate::error::Result;
use crate::feed::ChannelState;
use crate::remote::RemoteStore;
use crate::row::{Row, RowKey, Value};
use crate::snapshot::SharedSnapshot;

/// Where a mutation goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Immediate remote update
    WriteThrough,
    /// Local apply, broadcast, deferred write
    Coalesce,
}

/// Per-mutation write-through/buffer decision
pub struct MutationCoalescer {
    /// Remote table
    table: String,
    /// Field that identifies a row
    index_name: String,
    /// Coalescing window (None = always write through)
    window: Option<Duration>,
    /// Remote store client
    remote: Arc<dyn RemoteStore>,
    /// Local mirror
    snapshot: SharedSnapshot,
    /// Buffered writes
    drain: Arc<PendingWriteDrain>,
    /// Peer relay, only when a window is configured
    broadcast: Option<Arc<dyn BroadcastChannel>>,
    /// Broadcast subscription state, published by the lifecycle
    broadcast_state: watch::Receiver<ChannelState>,
    /// Broadcast event name
    event: String,
    /// Broadcast retry bound
    retry: RetryPolicy,
    /// Last write-through decided inside the window logic
    last_write: Mutex<Option<Instant>>,
}

impl MutationCoalescer {
    /// Create a coalescer
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: String,
        index_name: String,
        window: Option<Duration>,
        remote: Arc<dyn RemoteStore>,
        snapshot: SharedSnapshot,
        drain: Arc<PendingWriteDrain>,
        broadcast: Option<Arc<dyn BroadcastChannel>>,
        broadcast_state: watch::Receiver<ChannelState>,
        event: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            table,
            index_name,
            window,
            remote,
            snapshot,
            drain,
            broadcast,
            broadcast_state,
            event,
            retry,
            last_write: Mutex::new(None),
        }
    }

    /// Insert a row. Always written through.
    pub async fn add(&self, row: Row) -> Result<()> {
        tracing::debug!("Insert into {}", self.table);
        self.remote.insert(&self.table, row).await
    }

    /// Delete a row. Always written through; any buffered edit for the
    /// row is superseded.
    pub async fn remove(&self, key: &Value) -> Result<()> {
        let key = RowKey::from_value(key)?;
        if self.drain.discard(&key).await {
            tracing::debug!("Pending write for {} superseded by delete", key);
        }
        tracing::debug!("Delete {} from {}", key, self.table);
        self.remote.delete(&self.table, &key).await
    }

    /// Update a row, possibly deferring the remote write
    pub async fn mutate(&self, key: &Value, payload: Row) -> Result<()> {
        let row_key = RowKey::from_value(key)?;
        let payload = payload.without(&self.index_name);

        match self.route().await {
            Route::WriteThrough => self.write_through(&row_key, key, payload).await,
            Route::Coalesce => {
                self.coalesce(row_key, key, payload).await;
                Ok(())
            }
        }
    }

    /// Decide the route for a mutation issued now
    pub async fn route(&self) -> Route {
        let Some(window) = self.window else {
            return Route::WriteThrough;
        };
        if self.broadcast.is_none() || *self.broadcast_state.borrow() != ChannelState::Joined {
            return Route::WriteThrough;
        }

        let mut last_write = self.last_write.lock().await;
        let now = Instant::now();
        match *last_write {
            Some(at) if now.duration_since(at) < window => Route::Coalesce,
            _ => {
                *last_write = Some(now);
                Route::WriteThrough
            }
        }
    }

    async fn write_through(&self, key: &RowKey, key_value: &Value, payload: Row) -> Result<()> {
        // A buffered edit for this key goes out with the new payload on top.
        // The replaced row is kept so a rejected write can be undone.
        let replaced = if self.drain.is_pending(key).await {
            let mut snapshot = self.snapshot.write().await;
            let replaced = snapshot.find(key).cloned();
            snapshot.merge(key, &self.keyed(key_value, &payload));
            Some(replaced)
        } else {
            None
        };

        let flushed = self.drain.flush_all().await;
        if flushed.contains(key) {
            tracing::debug!("Update of {} already written by drain", key);
            return Ok(());
        }

        tracing::debug!("Update {} in {}", key, self.table);
        let result = self.remote.update(&self.table, key, payload).await;
        if result.is_err() {
            if let Some(replaced) = replaced {
                tracing::debug!("Update of {} rejected, restoring buffered state", key);
                self.snapshot.write().await.restore(key, replaced);
            }
        }
        result
    }

    async fn coalesce(&self, key: RowKey, key_value: &Value, payload: Row) {
        tracing::debug!("Coalescing update of {} in {}", key, self.table);

        let row = self.keyed(key_value, &payload);
        self.snapshot.write().await.merge(&key, &row);
        self.drain.queue(key.clone(), payload).await;

        if let Some(channel) = &self.broadcast {
            let message = BroadcastPayload { key, row };
            send_with_retry(channel.as_ref(), &self.event, &message, self.retry).await;
        }
    }

    /// `payload` with the index field as the caller supplied it
    fn keyed(&self, key_value: &Value, payload: &Row) -> Row {
        payload.clone().with(self.index_name.clone(), key_value.clone())
    }
}
