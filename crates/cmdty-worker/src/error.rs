//! Cache worker error types.

use thiserror::Error;

/// Network-level failure. Absorbed by the strategy fallback chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Quota exceeded in partition {partition} ({items} items, {bytes} bytes)")]
    QuotaExceeded {
        partition: String,
        items: usize,
        bytes: usize,
    },

    #[error("Install failed: {0}")]
    Install(String),

    #[error("Invalid control message: {0}")]
    InvalidMessage(String),

    #[error("Cache worker is not running")]
    WorkerClosed,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
