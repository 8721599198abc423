//! Sync error types.

use cmdty_persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Replay failed. The task stays queued.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server rejected task with status {status}")]
    Rejected { status: u16 },

    #[error("Task {action_type} could not be persisted")]
    NotPersisted { action_type: String },

    #[error("Probe setup failed: {0}")]
    Probe(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
