//! Stream client error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Stream client has shut down")]
    Shutdown,

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;
