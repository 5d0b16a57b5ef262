//! Lifecycle Controller
//!
//! Owns channel subscriptions for one store. Activation joins the
//! change feed (and the broadcast channel when coalescing is on) and
//! starts the dispatch loop; deactivation drains buffered writes to
//! completion before leaving either channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broadcast::{BroadcastChannel, BroadcastPayload};
use crate::coalesce::PendingWriteDrain;
use crate::error::Result;
use crate::feed::{ChangeApplier, ChangeEvent, ChangeFeed, ChannelState};
use crate::snapshot::SharedSnapshot;

/// Buffer size for inbound feed and broadcast events
const EVENT_BUFFER: usize = 1024;

/// Callback fired once when the broadcast channel first reports joined
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Channel subscription and teardown manager
pub struct LifecycleController {
    /// Remote table (for logging)
    table: String,
    /// Change feed
    feed: Arc<dyn ChangeFeed>,
    /// Peer relay, only when coalescing is configured
    broadcast: Option<Arc<dyn BroadcastChannel>>,
    /// Local mirror
    snapshot: SharedSnapshot,
    /// Feed event dispatcher
    applier: ChangeApplier,
    /// Buffered writes, drained on teardown
    drain: Arc<PendingWriteDrain>,
    /// Coalescing window, drives the background drain
    window: Option<Duration>,
    /// Broadcast state published to the coalescer
    broadcast_state: Arc<watch::Sender<ChannelState>>,
    /// Ready callback, taken on first join
    on_ready: Arc<Mutex<Option<ReadyCallback>>>,
    /// Dispatch loop and ticker while active
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Feed unsubscribe failed on the last teardown
    stale_feed: AtomicBool,
    /// Broadcast unsubscribe failed on the last teardown
    stale_broadcast: AtomicBool,
}

impl LifecycleController {
    /// Create an inactive controller
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: String,
        feed: Arc<dyn ChangeFeed>,
        broadcast: Option<Arc<dyn BroadcastChannel>>,
        snapshot: SharedSnapshot,
        applier: ChangeApplier,
        drain: Arc<PendingWriteDrain>,
        window: Option<Duration>,
        broadcast_state: watch::Sender<ChannelState>,
        on_ready: Option<ReadyCallback>,
    ) -> Self {
        Self {
            table,
            feed,
            broadcast,
            snapshot,
            applier,
            drain,
            window,
            broadcast_state: Arc::new(broadcast_state),
            on_ready: Arc::new(Mutex::new(on_ready)),
            tasks: Mutex::new(Vec::new()),
            stale_feed: AtomicBool::new(false),
            stale_broadcast: AtomicBool::new(false),
        }
    }

    /// Whether channels are currently subscribed
    pub async fn is_active(&self) -> bool {
        !self.tasks.lock().await.is_empty()
    }

    /// Join channels and start dispatching. A no-op when already active;
    /// a channel that is already joining or joined is left untouched
    /// unless the last teardown failed to leave it.
    pub async fn activate(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            tracing::debug!("Store for {} already active", self.table);
            return Ok(());
        }

        let (change_tx, change_rx) = mpsc::channel(EVENT_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = mpsc::channel(16);

        let dispatch = Dispatch {
            table: self.table.clone(),
            snapshot: Arc::clone(&self.snapshot),
            applier: self.applier.clone(),
            broadcast_state: Arc::clone(&self.broadcast_state),
            on_ready: Arc::clone(&self.on_ready),
        };
        tasks.push(tokio::spawn(dispatch.run(change_rx, inbound_rx, state_rx)));

        if let Err(e) = self.join_channels(change_tx, inbound_tx, state_tx).await {
            tracing::error!("Failed to activate store for {}: {}", self.table, e);
            for task in tasks.drain(..) {
                task.abort();
            }
            return Err(e);
        }

        if let Some(window) = self.window.filter(|w| !w.is_zero()) {
            tasks.push(tokio::spawn(window_ticker(Arc::clone(&self.drain), window)));
        }

        tracing::info!("Store for {} activated", self.table);
        Ok(())
    }

    /// Drain buffered writes, then leave both channels
    pub async fn deactivate(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        let flushed = self.drain.flush_all().await;
        let remaining = self.drain.pending_keys().await;
        if !remaining.is_empty() {
            tracing::warn!(
                "{} writes for {} still pending after teardown drain",
                remaining.len(),
                self.table
            );
        }

        if tasks.is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        if let Err(e) = self.feed.unsubscribe().await {
            tracing::warn!("Change feed unsubscribe for {} failed: {}", self.table, e);
            self.stale_feed.store(true, Ordering::SeqCst);
            result = Err(e);
        }
        if let Some(channel) = &self.broadcast {
            if let Err(e) = channel.unsubscribe().await {
                tracing::warn!("Broadcast unsubscribe for {} failed: {}", self.table, e);
                self.stale_broadcast.store(true, Ordering::SeqCst);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        for task in tasks.drain(..) {
            task.abort();
        }
        self.broadcast_state.send_replace(ChannelState::Idle);

        tracing::info!(
            "Store for {} deactivated, {} writes drained",
            self.table,
            flushed.len()
        );
        result
    }

    async fn join_channels(
        &self,
        change_tx: mpsc::Sender<ChangeEvent>,
        inbound_tx: mpsc::Sender<BroadcastPayload>,
        state_tx: mpsc::Sender<ChannelState>,
    ) -> Result<()> {
        // A subscription left over from a failed teardown delivers to a
        // dispatch loop that no longer exists, so it is replaced
        if self.stale_feed.load(Ordering::SeqCst) {
            tracing::info!("Rejoining change feed for {} after failed teardown", self.table);
            self.feed.unsubscribe().await?;
            self.stale_feed.store(false, Ordering::SeqCst);
        }
        let feed_state = self.feed.state().await;
        if feed_state.is_active() {
            tracing::debug!("Change feed for {} already {}", self.table, feed_state);
        } else {
            self.feed.subscribe(change_tx).await?;
        }

        if let Some(channel) = &self.broadcast {
            if self.stale_broadcast.load(Ordering::SeqCst) {
                tracing::info!("Rejoining broadcast for {} after failed teardown", self.table);
                channel.unsubscribe().await?;
                self.stale_broadcast.store(false, Ordering::SeqCst);
            }
            let state = channel.state().await;
            if state.is_active() {
                tracing::debug!("Broadcast for {} already {}", self.table, state);
            } else {
                channel.subscribe(inbound_tx, state_tx).await?;
            }
        }

        Ok(())
    }
}

/// State shared with the dispatch loop
struct Dispatch {
    table: String,
    snapshot: SharedSnapshot,
    applier: ChangeApplier,
    broadcast_state: Arc<watch::Sender<ChannelState>>,
    on_ready: Arc<Mutex<Option<ReadyCallback>>>,
}

impl Dispatch {
    /// Apply inbound events one at a time until every source closes
    async fn run(
        self,
        mut changes: mpsc::Receiver<ChangeEvent>,
        mut inbound: mpsc::Receiver<BroadcastPayload>,
        mut states: mpsc::Receiver<ChannelState>,
    ) {
        loop {
            tokio::select! {
                Some(event) = changes.recv() => {
                    let mut snapshot = self.snapshot.write().await;
                    self.applier.apply(&mut snapshot, event);
                }
                Some(payload) = inbound.recv() => {
                    // Peers only mirror; the sender owns the write
                    tracing::debug!("Peer edit for {} in {}", payload.key, self.table);
                    self.snapshot.write().await.merge(&payload.key, &payload.row);
                }
                Some(state) = states.recv() => {
                    tracing::debug!("Broadcast for {} is {}", self.table, state);
                    self.broadcast_state.send_replace(state);
                    if state == ChannelState::Joined {
                        if let Some(ready) = self.on_ready.lock().await.take() {
                            tracing::info!("Store for {} ready", self.table);
                            ready();
                        }
                    }
                }
                else => break,
            }
        }
        tracing::debug!("Dispatch loop for {} stopped", self.table);
    }
}

/// Drain once the oldest buffered write is a full window old
async fn window_ticker(drain: Arc<PendingWriteDrain>, window: Duration) {
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let due = matches!(drain.oldest_queued_at().await, Some(at) if at.elapsed() >= window);
        if due {
            drain.flush_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::error::Error;
    use crate::feed::MemoryFeed;
    use crate::remote::{MemoryRemote, RemoteStore};
    use crate::row::{Row, RowKey};
    use crate::snapshot::Snapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        remote: Arc<MemoryRemote>,
        hub: Arc<BroadcastHub>,
        feed: Arc<dyn ChangeFeed>,
        drain: Arc<PendingWriteDrain>,
        snapshot: SharedSnapshot,
        state_rx: watch::Receiver<ChannelState>,
        ready_count: Arc<AtomicUsize>,
        lifecycle: LifecycleController,
    }

    async fn harness(window: Option<Duration>) -> Harness {
        let remote = Arc::new(MemoryRemote::new("id"));
        remote.seed("todos", vec![Row::new().with("id", 1).with("text", "a")]).await;
        let hub = Arc::new(BroadcastHub::new());
        let feed: Arc<dyn ChangeFeed> = Arc::new(remote.feed("todos"));
        let channel: Arc<dyn BroadcastChannel> = Arc::new(hub.channel());

        let snapshot = Snapshot::new("id").shared();
        snapshot.write().await.replace_all(remote.rows("todos").await);
        let drain = Arc::new(PendingWriteDrain::new(
            "todos".into(),
            "id".into(),
            remote.clone(),
            snapshot.clone(),
        ));

        let ready_count = Arc::new(AtomicUsize::new(0));
        let counter = ready_count.clone();
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);

        let lifecycle = LifecycleController::new(
            "todos".into(),
            feed.clone(),
            Some(channel),
            snapshot.clone(),
            ChangeApplier::new("id"),
            drain.clone(),
            window,
            state_tx,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        Harness {
            remote,
            hub,
            feed,
            drain,
            snapshot,
            state_rx,
            ready_count,
            lifecycle,
        }
    }

    /// Change feed whose unsubscribe can be made to fail
    struct FlakyFeed {
        inner: MemoryFeed,
        fail_unsubscribe: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChangeFeed for FlakyFeed {
        async fn subscribe(&self, events: mpsc::Sender<ChangeEvent>) -> Result<()> {
            self.inner.subscribe(events).await
        }

        async fn unsubscribe(&self) -> Result<()> {
            if self.fail_unsubscribe.load(Ordering::SeqCst) {
                return Err(Error::RemoteUnavailable("feed unreachable".into()));
            }
            self.inner.unsubscribe().await
        }

        async fn state(&self) -> ChannelState {
            self.inner.state().await
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_activate_joins_and_fires_ready_once() {
        let h = harness(Some(Duration::from_secs(10))).await;

        h.lifecycle.activate().await.unwrap();
        h.lifecycle.activate().await.unwrap();
        settle().await;

        assert!(h.lifecycle.is_active().await);
        assert_eq!(h.feed.state().await, ChannelState::Joined);
        assert_eq!(*h.state_rx.borrow(), ChannelState::Joined);
        assert_eq!(h.hub.session_count().await, 1);

        h.lifecycle.deactivate().await.unwrap();
        h.lifecycle.activate().await.unwrap();
        settle().await;
        assert_eq!(h.ready_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_events_reach_snapshot() {
        let h = harness(None).await;
        h.lifecycle.activate().await.unwrap();
        settle().await;

        h.remote
            .insert("todos", Row::new().with("id", 2).with("text", "b"))
            .await
            .unwrap();
        h.remote.delete("todos", &RowKey::from(1)).await.unwrap();
        settle().await;

        let snapshot = h.snapshot.read().await;
        assert_eq!(snapshot.rows(), &[Row::new().with("id", 2).with("text", "b")]);
    }

    #[tokio::test]
    async fn test_deactivate_drains_before_unsubscribe() {
        let h = harness(Some(Duration::from_secs(10))).await;
        h.lifecycle.activate().await.unwrap();
        settle().await;

        h.snapshot
            .write()
            .await
            .merge(&RowKey::from(1), &Row::new().with("text", "z"));
        h.drain.queue(RowKey::from(1), Row::new().with("text", "z")).await;

        h.lifecycle.deactivate().await.unwrap();
        assert_eq!(
            h.remote.updates().await,
            vec![(RowKey::from(1), Row::new().with("text", "z"))]
        );
        assert!(h.drain.pending_keys().await.is_empty());
        assert_eq!(h.feed.state().await, ChannelState::Idle);
        assert_eq!(*h.state_rx.borrow(), ChannelState::Idle);
        assert_eq!(h.hub.session_count().await, 0);
        assert!(!h.lifecycle.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_ticker_drains_stale_writes() {
        let h = harness(Some(Duration::from_millis(500))).await;
        h.lifecycle.activate().await.unwrap();
        settle().await;

        h.snapshot
            .write()
            .await
            .merge(&RowKey::from(1), &Row::new().with("text", "late"));
        h.drain.queue(RowKey::from(1), Row::new().with("text", "late")).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;

        assert_eq!(h.remote.updates().await.len(), 1);
        assert!(h.drain.pending_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_feed_teardown_rejoins_on_next_activate() {
        let remote = Arc::new(MemoryRemote::new("id"));
        let feed = Arc::new(FlakyFeed {
            inner: remote.feed("todos"),
            fail_unsubscribe: AtomicBool::new(false),
        });
        let snapshot = Snapshot::new("id").shared();
        let drain = Arc::new(PendingWriteDrain::new(
            "todos".into(),
            "id".into(),
            remote.clone(),
            snapshot.clone(),
        ));
        let (state_tx, _state_rx) = watch::channel(ChannelState::Idle);
        let lifecycle = LifecycleController::new(
            "todos".into(),
            feed.clone(),
            None,
            snapshot.clone(),
            ChangeApplier::new("id"),
            drain,
            None,
            state_tx,
            None,
        );

        lifecycle.activate().await.unwrap();
        feed.fail_unsubscribe.store(true, Ordering::SeqCst);
        assert!(lifecycle.deactivate().await.is_err());
        assert_eq!(feed.state().await, ChannelState::Joined);

        feed.fail_unsubscribe.store(false, Ordering::SeqCst);
        lifecycle.activate().await.unwrap();
        settle().await;

        remote
            .insert("todos", Row::new().with("id", 1).with("text", "a"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(snapshot.read().await.len(), 1);
    }
}
