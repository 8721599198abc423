//! Control channel messages.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};

/// Control message posted to the cache worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Re-fetch `urls` (or the critical asset list when absent) into the cache.
    CacheUpdate {
        #[serde(default)]
        urls: Option<Vec<String>>,
    },
    /// Empty every partition.
    CacheClear,
}

impl WorkerMessage {
    pub fn parse(text: &str) -> CacheResult<Self> {
        serde_json::from_str(text).map_err(|e| CacheError::InvalidMessage(e.to_string()))
    }
}

/// Acknowledgement of a handled control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlAck {
    Updated { refreshed: usize, failed: usize },
    Cleared { entries: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"CACHE_UPDATE","urls":["/a","/b"]}"#).unwrap(),
            WorkerMessage::CacheUpdate {
                urls: Some(vec!["/a".into(), "/b".into()])
            }
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"CACHE_UPDATE"}"#).unwrap(),
            WorkerMessage::CacheUpdate { urls: None }
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"CACHE_CLEAR"}"#).unwrap(),
            WorkerMessage::CacheClear
        );
    }

    #[test]
    fn test_unknown_rejected() {
        assert!(matches!(
            WorkerMessage::parse(r#"{"type":"SKIP_WAITING"}"#),
            Err(CacheError::InvalidMessage(_))
        ));
        assert!(WorkerMessage::parse("[]").is_err());
    }
}
