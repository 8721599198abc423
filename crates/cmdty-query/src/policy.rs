//! Freshness policies per resource and device profile.

use crate::key::ResourceKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Device class the dashboard is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    /// Favours freshness.
    #[default]
    Desktop,
    /// Longer stale/gc times and slower refetch to save battery and data.
    Mobile,
}

/// Stale/gc timing for a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    stale_time: Duration,
    gc_time: Duration,
    refetch_interval: Option<Duration>,
}

impl CachePolicy {
    /// Build a policy. `gc_time` is raised to `stale_time` if shorter so that
    /// `stale_at <= gc_at` always holds.
    pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time: gc_time.max(stale_time),
            refetch_interval: None,
        }
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    pub fn gc_time(&self) -> Duration {
        self.gc_time
    }

    pub fn refetch_interval(&self) -> Option<Duration> {
        self.refetch_interval
    }

    /// Default policy for a resource family on a device profile.
    pub fn for_resource(kind: ResourceKind, profile: DeviceProfile) -> Self {
        const SEC: u64 = 1;
        const MIN: u64 = 60;

        let (stale, gc, refetch) = match (kind, profile) {
            (ResourceKind::Prices, DeviceProfile::Desktop) => (30 * SEC, 5 * MIN, Some(30 * SEC)),
            (ResourceKind::Prices, DeviceProfile::Mobile) => (60 * SEC, 10 * MIN, Some(60 * SEC)),
            (ResourceKind::History, DeviceProfile::Desktop) => (5 * MIN, 30 * MIN, None),
            (ResourceKind::History, DeviceProfile::Mobile) => (15 * MIN, 60 * MIN, None),
            (ResourceKind::News, DeviceProfile::Desktop) => (2 * MIN, 15 * MIN, Some(5 * MIN)),
            (ResourceKind::News, DeviceProfile::Mobile) => (5 * MIN, 30 * MIN, Some(10 * MIN)),
            (ResourceKind::Portfolio, DeviceProfile::Desktop) => (MIN, 10 * MIN, None),
            (ResourceKind::Portfolio, DeviceProfile::Mobile) => (2 * MIN, 20 * MIN, None),
            (ResourceKind::Other, DeviceProfile::Desktop) => (MIN, 5 * MIN, None),
            (ResourceKind::Other, DeviceProfile::Mobile) => (2 * MIN, 10 * MIN, None),
        };

        let policy = Self::new(Duration::from_secs(stale), Duration::from_secs(gc));
        match refetch {
            Some(secs) => policy.with_refetch_interval(Duration::from_secs(secs)),
            None => policy,
        }
    }
}
