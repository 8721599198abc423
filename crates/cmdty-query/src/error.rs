//! Query cache error types.

use thiserror::Error;

/// Errors surfaced by a query fetch.
///
/// `Clone` because one fetch result is shared by every caller attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status}")]
    Status { status: u16 },

    #[error("Offline")]
    Offline,

    #[error("Decode error: {0}")]
    Decode(String),
}

impl QueryError {
    /// Whether the failure is connectivity-related rather than a bad response.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Offline)
            || matches!(self, Self::Status { status } if *status >= 500)
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
