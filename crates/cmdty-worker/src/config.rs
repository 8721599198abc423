//! Cache worker configuration.

use crate::asset_cache::Budgets;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Origin relative asset paths are resolved against.
    pub origin: String,
    /// Partition name prefix.
    pub cache_prefix: String,
    /// Cache version. Partitions of any other version are deleted on activation.
    pub version: String,
    /// Precached on install. Install fails unless every one returns 200.
    pub critical_assets: Vec<String>,
    /// Precached best-effort on install.
    pub optional_assets: Vec<String>,
    pub max_optional_assets: usize,
    pub max_optional_asset_bytes: usize,
    /// Hosts whose requests are treated as API calls.
    pub api_hosts: Vec<String>,
    /// API path prefixes served stale-while-revalidate.
    pub swr_prefixes: Vec<String>,
    pub budgets: Budgets,
    /// Entries younger than this are never evicted.
    pub cleanup_interval: Duration,
    /// Where partitions are snapshotted. `None` keeps the cache in memory.
    pub snapshot_dir: Option<PathBuf>,
    /// How often dirty partitions are written out. A final write always
    /// happens on shutdown.
    pub snapshot_interval: Duration,
    /// Request channel depth.
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            cache_prefix: "cmdty".to_string(),
            version: "v1".to_string(),
            critical_assets: vec!["/".to_string(), "/manifest.webmanifest".to_string()],
            optional_assets: Vec::new(),
            max_optional_assets: 20,
            max_optional_asset_bytes: 512 * 1024,
            api_hosts: Vec::new(),
            swr_prefixes: vec!["/api/news".to_string()],
            budgets: Budgets::default(),
            cleanup_interval: Duration::from_secs(60),
            snapshot_dir: None,
            snapshot_interval: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}
