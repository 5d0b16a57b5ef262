//! In-Process Broadcast Hub
//!
//! Relays payloads between sessions living in the same process. Each
//! session gets its own [`HubChannel`]; a send reaches every other
//! joined session but never the sender.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use super::{BroadcastChannel, BroadcastPayload, SendStatus};
use crate::error::{Error, Result};
use crate::feed::ChannelState;

/// Shared relay between hub channels
pub struct BroadcastHub {
    /// Joined sessions: session id -> inbound sender
    sessions: RwLock<HashMap<Uuid, mpsc::Sender<BroadcastPayload>>>,
    /// Drop every send while set (simulates a relay without acks)
    dropping: RwLock<bool>,
    /// Total send attempts seen
    send_attempts: RwLock<u64>,
}

impl BroadcastHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            dropping: RwLock::new(false),
            send_attempts: RwLock::new(0),
        }
    }

    /// Create a channel for a new session
    pub fn channel(self: &Arc<Self>) -> HubChannel {
        HubChannel {
            hub: Arc::clone(self),
            id: Uuid::new_v4(),
            state: RwLock::new(ChannelState::Idle),
            states: Mutex::new(None),
        }
    }

    /// Drop (never acknowledge) sends while set
    pub async fn set_dropping(&self, dropping: bool) {
        *self.dropping.write().await = dropping;
    }

    /// Number of send attempts seen so far
    pub async fn send_attempts(&self) -> u64 {
        *self.send_attempts.read().await
    }

    /// Number of joined sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One session's view of a [`BroadcastHub`]
pub struct HubChannel {
    /// Relay
    hub: Arc<BroadcastHub>,
    /// Session id
    id: Uuid,
    /// Subscription state
    state: RwLock<ChannelState>,
    /// State listener while subscribed
    states: Mutex<Option<mpsc::Sender<ChannelState>>>,
}

impl HubChannel {
    /// Session id on the hub
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn transition(&self, next: ChannelState) {
        *self.state.write().await = next;
        if let Some(states) = self.states.lock().await.as_ref() {
            let _ = states.send(next).await;
        }
    }
}

#[async_trait::async_trait]
impl BroadcastChannel for HubChannel {
    async fn subscribe(
        &self,
        inbound: mpsc::Sender<BroadcastPayload>,
        states: mpsc::Sender<ChannelState>,
    ) -> Result<()> {
        if self.state.read().await.is_active() {
            return Ok(());
        }

        *self.states.lock().await = Some(states);
        self.transition(ChannelState::Joining).await;
        self.hub.sessions.write().await.insert(self.id, inbound);
        self.transition(ChannelState::Joined).await;

        tracing::debug!("Session {} joined broadcast hub", self.id);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.hub.sessions.write().await.remove(&self.id);
        self.transition(ChannelState::Idle).await;
        *self.states.lock().await = None;
        Ok(())
    }

    async fn send(&self, event: &str, payload: &BroadcastPayload) -> Result<SendStatus> {
        *self.hub.send_attempts.write().await += 1;

        if *self.state.read().await != ChannelState::Joined {
            return Err(Error::Broadcast(format!(
                "session {} is not joined, cannot send {}",
                self.id, event
            )));
        }
        if *self.hub.dropping.read().await {
            return Ok(SendStatus::TimedOut);
        }

        let peers: Vec<_> = self
            .hub
            .sessions
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(_, tx)| tx.clone())
            .collect();

        for peer in peers {
            // A peer mid-teardown is not our failure
            let _ = peer.send(payload.clone()).await;
        }
        Ok(SendStatus::Ack)
    }

    async fn state(&self) -> ChannelState {
        *self.state.read().await
    }
}
