//! Durable entity store for the commodity dashboard.
//!
//! Keeps price snapshots, portfolio entries, news items, user settings and
//! pending sync tasks across restarts. Each partition is an in-memory map
//! backed by an append-only JSON Lines log:
//! - every write is flushed before it is acknowledged
//! - a torn final line only loses that line
//! - logs are compacted after expiry pruning

pub mod error;
pub mod log;
pub mod store;

pub use error::{PersistenceError, PersistenceResult};
pub use store::{DurableStore, DurableStoreConfig, WriteOutcome};
