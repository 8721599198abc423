//! Offline cache worker.
//!
//! Provides:
//! - A versioned, partitioned HTTP asset cache with per-partition budgets
//! - Request classification into cache-first, network-first and
//!   stale-while-revalidate strategies
//! - Offline fallbacks for API calls, images and navigations
//! - An isolated worker task driven by install/activate lifecycle calls and
//!   JSON control messages

pub mod asset_cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod fallback;
pub mod http;
pub mod message;
pub mod network;
pub mod strategy;
pub mod worker;

pub use asset_cache::{
    AssetCache, Budgets, CacheEntry, PartitionBudget, PartitionKind, PartitionStats, PutOutcome,
    SnapshotJob,
};
pub use classify::{Classifier, RequestClass, Route, Strategy};
pub use config::WorkerConfig;
pub use error::{CacheError, CacheResult, FetchError};
pub use http::{Request, Response};
pub use message::{ControlAck, WorkerMessage};
pub use network::{Network, ReqwestNetwork};
pub use strategy::{ResponseSource, RouterOutcome};
pub use worker::{ActivateReport, CacheWorker, InstallReport, WorkerHandle};
