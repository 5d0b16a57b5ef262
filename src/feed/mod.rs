//! Change Feed Module
//!
//! Row-level change notifications pushed by the remote store, and the
//! applier that folds them into the local snapshot.

mod applier;
mod memory;

pub use applier::{Applied, ChangeApplier};
pub use memory::MemoryFeed;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::row::{Row, RowKey};

/// Subscription state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not subscribed
    Idle,
    /// Subscription requested, not yet confirmed
    Joining,
    /// Subscribed and delivering
    Joined,
}

impl ChannelState {
    /// Whether a subscribe call should leave this channel untouched
    pub fn is_active(&self) -> bool {
        matches!(self, ChannelState::Joining | ChannelState::Joined)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "IDLE"),
            ChannelState::Joining => write!(f, "JOINING"),
            ChannelState::Joined => write!(f, "JOINED"),
        }
    }
}

/// One row-level change, with partial old/new data as delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    /// Row inserted
    Insert { new: Row },
    /// Row updated
    Update {
        #[serde(default)]
        old: Row,
        new: Row,
    },
    /// Row deleted
    Delete { old: Row },
}

impl ChangeEvent {
    /// Decode an event from its JSON wire form
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Resolve the key this event targets.
    ///
    /// The applicable side (new for inserts and updates, old for
    /// deletes) is tried first, then the other side.
    pub fn key(&self, index_name: &str) -> Option<RowKey> {
        match self {
            ChangeEvent::Insert { new } => new.key(index_name),
            ChangeEvent::Update { old, new } => {
                new.key(index_name).or_else(|| old.key(index_name))
            }
            ChangeEvent::Delete { old } => old.key(index_name),
        }
    }

    /// Event kind name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "INSERT",
            ChangeEvent::Update { .. } => "UPDATE",
            ChangeEvent::Delete { .. } => "DELETE",
        }
    }
}

/// A change tagged with the table it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    pub event: ChangeEvent,
}

/// Push-based change feed for one table
#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start delivering events into `events`
    async fn subscribe(&self, events: mpsc::Sender<ChangeEvent>) -> Result<()>;

    /// Stop delivering events
    async fn unsubscribe(&self) -> Result<()>;

    /// Current subscription state
    async fn state(&self) -> ChannelState;
}
