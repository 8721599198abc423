//! Durable entity types and records.

use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Partition of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// Price snapshots, keyed by symbol.
    #[serde(rename = "commodities")]
    Commodities,
    /// Portfolio positions, keyed by id.
    #[serde(rename = "portfolio")]
    Portfolio,
    /// News items, keyed by id.
    #[serde(rename = "news")]
    News,
    /// User settings, keyed by setting name.
    #[serde(rename = "userSettings")]
    UserSettings,
    /// Pending offline mutations.
    #[serde(rename = "syncQueue")]
    SyncQueue,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        Self::Commodities,
        Self::Portfolio,
        Self::News,
        Self::UserSettings,
        Self::SyncQueue,
    ];

    /// Partition name on disk and on the wire.
    pub fn partition_name(&self) -> &'static str {
        match self {
            Self::Commodities => "commodities",
            Self::Portfolio => "portfolio",
            Self::News => "news",
            Self::UserSettings => "userSettings",
            Self::SyncQueue => "syncQueue",
        }
    }

    /// Payload field carrying the partition's secondary index, if any.
    pub fn index_field(&self) -> Option<&'static str> {
        match self {
            Self::Commodities => Some("lastUpdated"),
            Self::News => Some("publishedAt"),
            _ => None,
        }
    }

    /// Whether records in this partition are subject to retention pruning.
    ///
    /// Pending sync tasks are only removed on acknowledgment.
    pub fn expires(&self) -> bool {
        !matches!(self, Self::SyncQueue | Self::UserSettings)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.partition_name())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.partition_name() == s)
            .ok_or_else(|| CoreError::UnknownEntityType(s.to_string()))
    }
}

/// A keyed snapshot stored in a durable partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableRecord {
    pub entity_type: EntityType,
    pub key: String,
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

impl DurableRecord {
    /// Read the partition's index field from the payload as a timestamp.
    ///
    /// Accepts RFC 3339 strings and epoch milliseconds.
    pub fn indexed_at(&self) -> Option<DateTime<Utc>> {
        let field = self.entity_type.index_field()?;
        match self.payload.get(field)? {
            serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_names_round_trip() {
        for entity in EntityType::ALL {
            let parsed: EntityType = entity.partition_name().parse().unwrap();
            assert_eq!(parsed, entity);
        }
        assert!("orders".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_indexed_at_rfc3339_and_millis() {
        let news = DurableRecord {
            entity_type: EntityType::News,
            key: "n1".into(),
            payload: json!({"publishedAt": "2024-03-01T10:00:00Z"}),
            written_at: Utc::now(),
        };
        assert_eq!(
            news.indexed_at().unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );

        let price = DurableRecord {
            entity_type: EntityType::Commodities,
            key: "Gold Futures".into(),
            payload: json!({"lastUpdated": 1_700_000_000_000_i64}),
            written_at: Utc::now(),
        };
        assert_eq!(price.indexed_at().unwrap().timestamp_millis(), 1_700_000_000_000);

        let setting = DurableRecord {
            entity_type: EntityType::UserSettings,
            key: "theme".into(),
            payload: json!({"lastUpdated": 1}),
            written_at: Utc::now(),
        };
        assert!(setting.indexed_at().is_none());
    }
}
