//! Write Coalescing Module
//!
//! Decides per mutation whether to write through or buffer, and drains
//! buffered mutations back to the remote store.

mod coalescer;
mod drain;

pub use coalescer::{MutationCoalescer, Route};
pub use drain::{PendingMutation, PendingWriteDrain};
