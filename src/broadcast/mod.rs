//! Broadcast Module
//!
//! Peer-to-peer relay used to push coalesced, not-yet-written edits to
//! the other sessions mirroring the same table.

mod hub;

pub use hub::{BroadcastHub, HubChannel};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::BroadcastConfig;
use crate::error::Result;
use crate::feed::ChannelState;
use crate::row::{Row, RowKey};

/// A coalesced edit relayed to peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    /// Row being edited
    pub key: RowKey,
    /// Edited fields plus the index field as the writer supplied it
    pub row: Row,
}

/// Result of a single send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Relay acknowledged the message
    Ack,
    /// No acknowledgement in time
    TimedOut,
}

/// Broadcast side-channel
#[async_trait::async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Join the channel. Inbound payloads go to `inbound`, state
    /// transitions to `states`.
    async fn subscribe(
        &self,
        inbound: mpsc::Sender<BroadcastPayload>,
        states: mpsc::Sender<ChannelState>,
    ) -> Result<()>;

    /// Leave the channel
    async fn unsubscribe(&self) -> Result<()>;

    /// Send one payload to every other session
    async fn send(&self, event: &str, payload: &BroadcastPayload) -> Result<SendStatus>;

    /// Current subscription state
    async fn state(&self) -> ChannelState;
}

/// Bounded retry for broadcast sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts
    pub attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

impl From<&BroadcastConfig> for RetryPolicy {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

/// Send until acknowledged or out of attempts. Returns whether the
/// payload was acknowledged; exhaustion is logged, never an error.
pub async fn send_with_retry(
    channel: &dyn BroadcastChannel,
    event: &str,
    payload: &BroadcastPayload,
    policy: RetryPolicy,
) -> bool {
    for attempt in 1..=policy.attempts {
        match channel.send(event, payload).await {
            Ok(SendStatus::Ack) => {
                tracing::debug!("Broadcast {} for {} acked on attempt {}", event, payload.key, attempt);
                return true;
            }
            Ok(SendStatus::TimedOut) => {
                tracing::debug!("Broadcast {} for {} timed out (attempt {})", event, payload.key, attempt);
            }
            Err(e) => {
                tracing::debug!("Broadcast {} for {} failed (attempt {}): {}", event, payload.key, attempt, e);
            }
        }

        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    tracing::warn!(
        "Broadcast {} for {} abandoned after {} attempts",
        event,
        payload.key,
        policy.attempts
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn payload() -> BroadcastPayload {
        BroadcastPayload {
            key: RowKey::from(1),
            row: Row::new().with("text", "b"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_after_bound() {
        let hub = Arc::new(BroadcastHub::new());
        let channel = hub.channel();
        let (tx, _rx) = mpsc::channel(8);
        let (state_tx, _state_rx) = mpsc::channel(8);
        channel.subscribe(tx, state_tx).await.unwrap();
        hub.set_dropping(true).await;

        let start = tokio::time::Instant::now();
        let delivered = send_with_retry(&channel, "mutate", &payload(), RetryPolicy::default()).await;

        assert!(!delivered);
        assert_eq!(hub.send_attempts().await, 10);
        // Nine pauses between ten attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_stops_on_ack() {
        let hub = Arc::new(BroadcastHub::new());
        let channel = hub.channel();
        let (tx, _rx) = mpsc::channel(8);
        let (state_tx, _state_rx) = mpsc::channel(8);
        channel.subscribe(tx, state_tx).await.unwrap();

        assert!(send_with_retry(&channel, "mutate", &payload(), RetryPolicy::default()).await);
        assert_eq!(hub.send_attempts().await, 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = BroadcastConfig {
            event: "mutate".into(),
            retry_attempts: 0,
            retry_delay_ms: 5,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.delay, Duration::from_millis(5));
    }
}
