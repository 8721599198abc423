//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream error: {0}")]
    Stream(#[from] cmdty_ws::StreamError),

    #[error("Cache worker error: {0}")]
    Cache(#[from] cmdty_worker::CacheError),

    #[error("Sync error: {0}")]
    Sync(#[from] cmdty_sync::SyncError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] cmdty_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] cmdty_telemetry::TelemetryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
