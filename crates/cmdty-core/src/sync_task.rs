//! Offline mutation tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A mutation performed while offline, waiting to be replayed.
///
/// `id` doubles as the idempotency key sent with every replay attempt, so a
/// task acknowledged by the server but not yet removed locally is not applied
/// twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: Uuid,
    /// Enqueue order; replay follows ascending `seq`.
    pub seq: u64,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl SyncTask {
    pub fn new(seq: u64, action_type: impl Into<String>, payload: serde_json::Value, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            action_type: action_type.into(),
            payload,
            enqueued_at,
            attempts: 0,
        }
    }

    /// Durable-store key. Zero-padded so lexical order equals `seq` order.
    pub fn store_key(&self) -> String {
        format!("{:020}", self.seq)
    }

    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_key_orders_by_seq() {
        let a = SyncTask::new(9, "portfolio.add", json!({}), Utc::now());
        let b = SyncTask::new(10, "portfolio.add", json!({}), Utc::now());
        assert!(a.store_key() < b.store_key());
    }

    #[test]
    fn test_serialized_shape() {
        let task = SyncTask::new(1, "settings.update", json!({"theme": "dark"}), Utc::now());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["actionType"], "settings.update");
        assert_eq!(value["attempts"], 0);
    }
}
