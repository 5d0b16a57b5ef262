//! Sync Store
//!
//! The handle applications hold. A [`SyncStore`] owns the snapshot of
//! one remote table and wires the applier, coalescer, drain and
//! lifecycle around it.
//!
//! Observers drive the lifecycle: the first subscription joins the
//! change feed (and the broadcast channel when coalescing is on), the
//! last one leaves them after draining buffered writes.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::broadcast::{BroadcastChannel, RetryPolicy};
use crate::coalesce::{MutationCoalescer, PendingWriteDrain};
use crate::config::{StoreConfig, WolfSyncConfig};
use crate::error::Result;
use crate::feed::{ChangeApplier, ChangeFeed, ChannelState};
use crate::lifecycle::{LifecycleController, ReadyCallback};
use crate::remote::RemoteStore;
use crate::row::{Row, RowKey, Value};
use crate::snapshot::{Observer, ObserverId, SharedSnapshot, Snapshot};

/// Live mirror of one remote table
#[derive(Clone)]
pub struct SyncStore {
    /// Store configuration
    config: StoreConfig,
    /// Remote store client
    remote: Arc<dyn RemoteStore>,
    /// Local mirror
    snapshot: SharedSnapshot,
    /// Write routing
    coalescer: Arc<MutationCoalescer>,
    /// Buffered writes
    drain: Arc<PendingWriteDrain>,
    /// Channel subscriptions
    lifecycle: Arc<LifecycleController>,
    /// Serializes observer changes with activation and teardown
    membership: Arc<Mutex<()>>,
    /// Broadcast subscription state
    broadcast_state: watch::Receiver<ChannelState>,
}

impl SyncStore {
    /// Create a store. The broadcast channel is only used when a
    /// coalescing window is configured.
    pub fn new(
        config: &WolfSyncConfig,
        remote: Arc<dyn RemoteStore>,
        feed: Arc<dyn ChangeFeed>,
        broadcast: Option<Arc<dyn BroadcastChannel>>,
        on_ready: Option<ReadyCallback>,
    ) -> Result<Self> {
        config.validate()?;
        let store = config.store.clone();
        let window = store.mutate_interval();

        let broadcast = match (window, broadcast) {
            (Some(_), broadcast) => broadcast,
            (None, Some(_)) => {
                tracing::debug!(
                    "No mutate interval for {}, broadcast channel unused",
                    store.table
                );
                None
            }
            (None, None) => None,
        };

        let snapshot = Snapshot::new(store.index_name.clone()).shared();
        let drain = Arc::new(PendingWriteDrain::new(
            store.table.clone(),
            store.index_name.clone(),
            Arc::clone(&remote),
            Arc::clone(&snapshot),
        ));

        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);

        let coalescer = Arc::new(MutationCoalescer::new(
            store.table.clone(),
            store.index_name.clone(),
            window,
            Arc::clone(&remote),
            Arc::clone(&snapshot),
            Arc::clone(&drain),
            broadcast.clone(),
            state_rx.clone(),
            config.broadcast.event.clone(),
            RetryPolicy::from(&config.broadcast),
        ));

        let lifecycle = Arc::new(LifecycleController::new(
            store.table.clone(),
            feed,
            broadcast,
            Arc::clone(&snapshot),
            ChangeApplier::new(store.index_name.clone()),
            Arc::clone(&drain),
            window,
            state_tx,
            on_ready,
        ));

        Ok(Self {
            config: store,
            remote,
            snapshot,
            coalescer,
            drain,
            lifecycle,
            membership: Arc::new(Mutex::new(())),
            broadcast_state: state_rx,
        })
    }

    /// Table this store mirrors
    pub fn table(&self) -> &str {
        &self.config.table
    }

    /// Replace the snapshot with the remote table's current contents
    pub async fn load(&self) -> Result<usize> {
        let rows = self.remote.select(&self.config.table).await?;
        let mut snapshot = self.snapshot.write().await;
        snapshot.replace_all(rows);

        tracing::info!("Loaded {} rows from {}", snapshot.len(), self.config.table);
        Ok(snapshot.len())
    }

    /// Current rows
    pub async fn rows(&self) -> Vec<Row> {
        self.snapshot.read().await.rows().to_vec()
    }

    /// Look up a row by its index value
    pub async fn get(&self, key: &Value) -> Result<Option<Row>> {
        let key = RowKey::from_value(key)?;
        Ok(self.snapshot.read().await.find(&key).cloned())
    }

    /// Register an observer. The first one activates the channels.
    pub async fn subscribe(&self, observer: Observer) -> Result<ObserverId> {
        let _membership = self.membership.lock().await;
        let (id, first) = {
            let mut snapshot = self.snapshot.write().await;
            let id = snapshot.subscribe(observer);
            (id, snapshot.observer_count() == 1)
        };

        if first {
            if let Err(e) = self.lifecycle.activate().await {
                self.snapshot.write().await.unsubscribe(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Detach an observer. The last one tears the channels down.
    pub async fn unsubscribe(&self, id: ObserverId) -> Result<()> {
        let _membership = self.membership.lock().await;
        let (removed, remaining) = {
            let mut snapshot = self.snapshot.write().await;
            let removed = snapshot.unsubscribe(id);
            (removed, snapshot.observer_count())
        };

        if removed && remaining == 0 {
            self.lifecycle.deactivate().await?;
        }
        Ok(())
    }

    /// Whether the channels are currently joined on behalf of observers
    pub async fn is_active(&self) -> bool {
        self.lifecycle.is_active().await
    }

    /// Insert a row remotely
    pub async fn add(&self, row: Row) -> Result<()> {
        self.coalescer.add(row).await
    }

    /// Delete a row remotely
    pub async fn remove(&self, key: &Value) -> Result<()> {
        self.coalescer.remove(key).await
    }

    /// Update a row, coalescing when inside the window
    pub async fn mutate(&self, key: &Value, payload: Row) -> Result<()> {
        self.coalescer.mutate(key, payload).await
    }

    /// Drain buffered writes now. Returns the keys written.
    pub async fn flush(&self) -> Vec<RowKey> {
        self.drain.flush_all().await
    }

    /// Keys with buffered writes
    pub async fn pending_keys(&self) -> Vec<RowKey> {
        self.drain.pending_keys().await
    }

    /// Broadcast subscription state
    pub fn broadcast_state(&self) -> ChannelState {
        *self.broadcast_state.borrow()
    }

    /// Drain and leave every channel, regardless of observers
    pub async fn shutdown(&self) -> Result<()> {
        let _membership = self.membership.lock().await;
        tracing::info!("Shutting down store for {}", self.config.table);
        self.lifecycle.deactivate().await
    }
}
