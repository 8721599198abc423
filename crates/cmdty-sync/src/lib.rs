//! Offline synchronization.
//!
//! Provides:
//! - `SyncQueue`: persisted FIFO of mutations made while offline, replayed
//!   in order when connectivity returns
//! - `NetworkMonitor`: probe-driven online/offline tracking with transition
//!   events and user notifications

pub mod error;
pub mod monitor;
pub mod queue;

pub use error::{SyncError, SyncResult};
pub use monitor::{
    ConnectivityProbe, NetworkEvent, NetworkMonitor, NetworkStatus, NetworkSubscription,
    ReqwestProbe,
};
pub use queue::{DrainOutcome, DrainReport, SyncQueue, SyncQueueConfig, SyncTransport};
