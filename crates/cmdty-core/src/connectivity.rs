//! Connectivity gate shared by components that must not touch the network
//! while offline.

/// Read-only view of the current connectivity.
pub trait Connectivity: Send + Sync {
    /// Whether the network is currently reachable.
    fn is_online(&self) -> bool;

    /// Whether low-priority work (prefetch, speculative refresh) may run.
    fn allow_non_critical(&self) -> bool {
        self.is_online()
    }
}

/// Connectivity that never goes offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}
