//! In-Memory Change Feed
//!
//! Follows one table on a [`MemoryRemote`](crate::remote::MemoryRemote)
//! change stream.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use super::{ChangeEvent, ChangeFeed, ChannelState, TableChange};
use crate::error::Result;

/// Change feed backed by an in-process broadcast stream
pub struct MemoryFeed {
    /// Table to follow
    table: String,
    /// Source stream
    changes: broadcast::Sender<TableChange>,
    /// Subscription state
    state: Arc<RwLock<ChannelState>>,
    /// Forwarding task while subscribed
    forwarder: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryFeed {
    /// Create a feed for `table` over `changes`
    pub fn new(table: impl Into<String>, changes: broadcast::Sender<TableChange>) -> Self {
        Self {
            table: table.into(),
            changes,
            state: Arc::new(RwLock::new(ChannelState::Idle)),
            forwarder: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MemoryFeed {
    async fn subscribe(&self, events: mpsc::Sender<ChangeEvent>) -> Result<()> {
        let mut forwarder = self.forwarder.lock().await;
        if self.state.read().await.is_active() {
            return Ok(());
        }

        *self.state.write().await = ChannelState::Joining;

        let mut rx = self.changes.subscribe();
        let table = self.table.clone();
        let state = Arc::clone(&self.state);

        *forwarder = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) if change.table == table => {
                        if events.send(change.event).await.is_err() {
                            tracing::debug!("Feed receiver for {} dropped", table);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Feed for {} lagged, {} events missed", table, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            *state.write().await = ChannelState::Idle;
        }));

        *self.state.write().await = ChannelState::Joined;
        tracing::debug!("Memory feed joined for table {}", self.table);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }
        *self.state.write().await = ChannelState::Idle;
        Ok(())
    }

    async fn state(&self) -> ChannelState {
        *self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;

    #[tokio::test]
    async fn test_filters_by_table() {
        let (changes, _keep) = broadcast::channel(16);
        let feed = MemoryFeed::new("todos", changes.clone());
        let (tx, mut rx) = mpsc::channel(16);

        feed.subscribe(tx).await.unwrap();
        assert_eq!(feed.state().await, ChannelState::Joined);

        let other = ChangeEvent::Insert { new: Row::new().with("id", 1) };
        let mine = ChangeEvent::Insert { new: Row::new().with("id", 2) };
        changes
            .send(TableChange { table: "notes".into(), event: other })
            .unwrap();
        changes
            .send(TableChange { table: "todos".into(), event: mine.clone() })
            .unwrap();

        assert_eq!(rx.recv().await, Some(mine));

        feed.unsubscribe().await.unwrap();
        assert_eq!(feed.state().await, ChannelState::Idle);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (changes, _keep) = broadcast::channel(16);
        let feed = MemoryFeed::new("todos", changes.clone());
        let (tx, _rx) = mpsc::channel(16);

        feed.subscribe(tx.clone()).await.unwrap();
        feed.subscribe(tx).await.unwrap();
        assert_eq!(changes.receiver_count(), 2);
    }
}
