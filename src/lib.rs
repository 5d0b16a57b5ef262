//! WolfSync - Live Table Mirror
//!
//! Keeps an in-memory copy of a remote table in sync through a
//! server-pushed change feed, and coalesces bursts of local edits so
//! the remote store sees fewer writes.
//!
//! # Architecture
//!
//! A [`SyncStore`] owns one [`Snapshot`](snapshot::Snapshot). Change
//! events flow through a single dispatch loop into the snapshot and on
//! to observers. Updates either write through to the remote store or,
//! inside the coalescing window, are applied locally, relayed to peer
//! sessions over a broadcast channel and written later by the drain.
//!
//! # Features
//!
//! - Ordered snapshot with observer notification on every change
//! - Idempotent application of insert, update and delete events
//! - Time-windowed write coalescing with last-write-wins replacement
//! - Drain-before-write ordering and drain-before-teardown
//! - Bounded broadcast retry to peer sessions
//! - In-memory remote, feed and relay for tests and demos

pub mod broadcast;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod remote;
pub mod row;
pub mod snapshot;
pub mod store;

pub use config::WolfSyncConfig;
pub use error::{Error, Result};
pub use store::SyncStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broadcast::{BroadcastChannel, BroadcastPayload, SendStatus};
    pub use crate::config::{StoreConfig, WolfSyncConfig};
    pub use crate::error::{Error, Result};
    pub use crate::feed::{ChangeEvent, ChangeFeed, ChannelState};
    pub use crate::lifecycle::ReadyCallback;
    pub use crate::remote::RemoteStore;
    pub use crate::row::{Row, RowKey, Value};
    pub use crate::snapshot::{Observer, ObserverId};
    pub use crate::store::SyncStore;
}
