//! Application configuration.

use crate::error::{AppError, AppResult};
use cmdty_persistence::DurableStoreConfig;
use cmdty_query::{DeviceProfile, PrefetchConfig, QueryCacheConfig};
use cmdty_sync::SyncQueueConfig;
use cmdty_worker::{Budgets, PartitionBudget, WorkerConfig};
use cmdty_ws::StreamConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Price stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_stream_url")]
    pub url: String,
    /// Whether the user may receive live prices.
    #[serde(default = "default_true")]
    pub entitled: bool,
    /// Base delay for exponential backoff (ms).
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Backoff cap (ms).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Outbound control messages per minute.
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: u32,
    /// Price update broadcast buffer.
    #[serde(default = "default_price_buffer")]
    pub price_buffer: usize,
}

fn default_stream_url() -> String {
    "ws://localhost:3001/ws/prices".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_messages_per_minute() -> u32 {
    60
}

fn default_price_buffer() -> usize {
    1024
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            entitled: true,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_messages_per_minute: default_max_messages_per_minute(),
            price_buffer: default_price_buffer(),
        }
    }
}

impl StreamSection {
    pub fn to_stream_config(&self, user_id: Option<String>) -> StreamConfig {
        StreamConfig {
            url: self.url.clone(),
            user_id,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            reconnect_max_delay_ms: self.reconnect_max_delay_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            max_messages_per_minute: self.max_messages_per_minute,
            ..StreamConfig::default()
        }
    }
}

/// In-memory query cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheSection {
    /// Size target for the sweep (bytes). Default: 5 MiB.
    #[serde(default = "default_query_budget_bytes")]
    pub budget_bytes: usize,
    #[serde(default = "default_query_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long failed entries without data are kept.
    #[serde(default = "default_error_retention_secs")]
    pub error_retention_secs: u64,
    /// Granularity of interval refetching (ms).
    #[serde(default = "default_refetch_tick_ms")]
    pub refetch_tick_ms: u64,
}

fn default_query_budget_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_query_sweep_interval_secs() -> u64 {
    300
}

fn default_error_retention_secs() -> u64 {
    300
}

fn default_refetch_tick_ms() -> u64 {
    5_000
}

impl Default for QueryCacheSection {
    fn default() -> Self {
        Self {
            budget_bytes: default_query_budget_bytes(),
            sweep_interval_secs: default_query_sweep_interval_secs(),
            error_retention_secs: default_error_retention_secs(),
            refetch_tick_ms: default_refetch_tick_ms(),
        }
    }
}

impl From<&QueryCacheSection> for QueryCacheConfig {
    fn from(section: &QueryCacheSection) -> Self {
        Self {
            budget_bytes: section.budget_bytes,
            sweep_interval: Duration::from_secs(section.sweep_interval_secs),
            error_retention: Duration::from_secs(section.error_retention_secs),
            refetch_tick: Duration::from_millis(section.refetch_tick_ms),
        }
    }
}

/// Offline asset cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetCacheSection {
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    /// Bumping this drops every partition of the previous version on activation.
    #[serde(default = "default_cache_version")]
    pub version: String,
    #[serde(default = "default_critical_assets")]
    pub critical_assets: Vec<String>,
    #[serde(default)]
    pub optional_assets: Vec<String>,
    #[serde(default = "default_max_optional_assets")]
    pub max_optional_assets: usize,
    #[serde(default = "default_max_optional_asset_bytes")]
    pub max_optional_asset_bytes: usize,
    /// Extra hosts treated as API origins.
    #[serde(default)]
    pub api_hosts: Vec<String>,
    #[serde(default = "default_swr_prefixes")]
    pub swr_prefixes: Vec<String>,
    #[serde(default = "default_static_budget")]
    pub static_budget: PartitionBudget,
    #[serde(default = "default_dynamic_budget")]
    pub dynamic_budget: PartitionBudget,
    #[serde(default = "default_api_budget")]
    pub api_budget: PartitionBudget,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_cache_prefix() -> String {
    "cmdty".to_string()
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_critical_assets() -> Vec<String> {
    vec!["/".to_string(), "/manifest.webmanifest".to_string()]
}

fn default_max_optional_assets() -> usize {
    20
}

fn default_max_optional_asset_bytes() -> usize {
    512 * 1024
}

fn default_swr_prefixes() -> Vec<String> {
    vec!["/api/news".to_string()]
}

fn default_static_budget() -> PartitionBudget {
    Budgets::default().static_assets
}

fn default_dynamic_budget() -> PartitionBudget {
    Budgets::default().dynamic
}

fn default_api_budget() -> PartitionBudget {
    Budgets::default().api
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

impl Default for AssetCacheSection {
    fn default() -> Self {
        Self {
            prefix: default_cache_prefix(),
            version: default_cache_version(),
            critical_assets: default_critical_assets(),
            optional_assets: Vec::new(),
            max_optional_assets: default_max_optional_assets(),
            max_optional_asset_bytes: default_max_optional_asset_bytes(),
            api_hosts: Vec::new(),
            swr_prefixes: default_swr_prefixes(),
            static_budget: default_static_budget(),
            dynamic_budget: default_dynamic_budget(),
            api_budget: default_api_budget(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            snapshot_dir: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl AssetCacheSection {
    pub fn to_worker_config(&self, origin: &str) -> WorkerConfig {
        WorkerConfig {
            origin: origin.to_string(),
            cache_prefix: self.prefix.clone(),
            version: self.version.clone(),
            critical_assets: self.critical_assets.clone(),
            optional_assets: self.optional_assets.clone(),
            max_optional_assets: self.max_optional_assets,
            max_optional_asset_bytes: self.max_optional_asset_bytes,
            api_hosts: self.api_hosts.clone(),
            swr_prefixes: self.swr_prefixes.clone(),
            budgets: Budgets {
                static_assets: self.static_budget,
                dynamic: self.dynamic_budget,
                api: self.api_budget,
            },
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            snapshot_dir: self.snapshot_dir.clone(),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            ..WorkerConfig::default()
        }
    }
}

/// Durable entity store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableStoreSection {
    /// `None` keeps the store in memory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_max_records_per_partition")]
    pub max_records_per_partition: usize,
    #[serde(default = "default_store_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_retention_hours() -> u64 {
    24
}

fn default_max_records_per_partition() -> usize {
    10_000
}

fn default_store_sweep_interval_secs() -> u64 {
    3_600
}

impl Default for DurableStoreSection {
    fn default() -> Self {
        Self {
            dir: None,
            retention_hours: default_retention_hours(),
            max_records_per_partition: default_max_records_per_partition(),
            sweep_interval_secs: default_store_sweep_interval_secs(),
        }
    }
}

impl From<&DurableStoreSection> for DurableStoreConfig {
    fn from(section: &DurableStoreSection) -> Self {
        Self {
            dir: section.dir.clone(),
            retention: Duration::from_secs(section.retention_hours * 60 * 60),
            max_records_per_partition: section.max_records_per_partition,
        }
    }
}

/// Offline mutation replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Path, relative to `api_base_url`, that replayed mutations are POSTed to.
    #[serde(default = "default_sync_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_notify_after_attempts")]
    pub notify_after_attempts: u32,
}

fn default_sync_endpoint() -> String {
    "/api/sync".to_string()
}

fn default_notify_after_attempts() -> u32 {
    3
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            endpoint: default_sync_endpoint(),
            notify_after_attempts: default_notify_after_attempts(),
        }
    }
}

impl From<&SyncSection> for SyncQueueConfig {
    fn from(section: &SyncSection) -> Self {
        Self {
            notify_after_attempts: section.notify_after_attempts,
        }
    }
}

/// Connectivity probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// HEAD target. Defaults to `<api_base_url>/api/health` when unset.
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Predictive prefetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_prefetch_spacing_ms")]
    pub spacing_ms: u64,
    #[serde(default = "default_history_ranges")]
    pub ranges: Vec<String>,
}

fn default_prefetch_spacing_ms() -> u64 {
    500
}

fn default_history_ranges() -> Vec<String> {
    PrefetchConfig::default().ranges
}

impl Default for PrefetchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            spacing_ms: default_prefetch_spacing_ms(),
            ranges: default_history_ranges(),
        }
    }
}

impl From<&PrefetchSection> for PrefetchConfig {
    fn from(section: &PrefetchSection) -> Self {
        Self {
            spacing: Duration::from_millis(section.spacing_ms),
            ranges: section.ranges.clone(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dashboard origin. API paths and precached assets resolve against it.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub profile: DeviceProfile,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Symbols subscribed at startup.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Interval for sampling component state into metrics.
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// Prometheus text file rewritten on every sample (textfile collector).
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub query_cache: QueryCacheSection,
    #[serde(default)]
    pub asset_cache: AssetCacheSection,
    #[serde(default)]
    pub durable_store: DurableStoreSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub prefetch: PrefetchSection,
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_metrics_interval_secs() -> u64 {
    15
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            profile: DeviceProfile::default(),
            user_id: None,
            symbols: Vec::new(),
            metrics_interval_secs: default_metrics_interval_secs(),
            metrics_file: None,
            stream: StreamSection::default(),
            query_cache: QueryCacheSection::default(),
            asset_cache: AssetCacheSection::default(),
            durable_store: DurableStoreSection::default(),
            sync: SyncSection::default(),
            network: NetworkSection::default(),
            prefetch: PrefetchSection::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        reqwest::Url::parse(&self.api_base_url)
            .map_err(|e| AppError::Config(format!("Invalid api_base_url: {e}")))?;
        if !(self.stream.url.starts_with("ws://") || self.stream.url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "stream.url must be a ws:// or wss:// URL, got {}",
                self.stream.url
            )));
        }
        if self.stream.reconnect_base_delay_ms > self.stream.reconnect_max_delay_ms {
            return Err(AppError::Config(
                "stream.reconnect_base_delay_ms exceeds reconnect_max_delay_ms".to_string(),
            ));
        }
        if self.stream.max_messages_per_minute == 0 {
            return Err(AppError::Config(
                "stream.max_messages_per_minute must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn probe_url(&self) -> String {
        self.network.probe_url.clone().unwrap_or_else(|| {
            format!("{}/api/health", self.api_base_url.trim_end_matches('/'))
        })
    }
}
