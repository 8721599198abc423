//! Persistence error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Quota exceeded for partition {partition}: limit={limit}")]
    QuotaExceeded { partition: String, limit: usize },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
