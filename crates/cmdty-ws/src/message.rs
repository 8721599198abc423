//! Stream subprotocol messages.

use chrono::{DateTime, Utc};
use cmdty_core::{Price, PriceSource, PriceTick};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};

// ============================================================================
// Client -> server
// ============================================================================

/// Control message sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        commodities: Vec<String>,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        commodities: Vec<String>,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Heartbeat. `timestamp` is epoch milliseconds.
    Ping { timestamp: i64 },
}

impl ClientMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ping { .. } => "ping",
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Message pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PriceUpdate {
        data: PriceUpdateData,
    },
    ConnectionStatus {
        connected: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Error {
        error: String,
    },
}

/// Payload of a `price_update` message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdateData {
    pub symbol: String,
    pub price: Price,
    #[serde(default)]
    pub bid: Option<Price>,
    #[serde(default)]
    pub ask: Option<Price>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    /// RFC 3339 text or epoch milliseconds on the wire.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_update: DateTime<Utc>,
}

fn deserialize_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireTime {
        Text(DateTime<Utc>),
        Millis(i64),
    }

    match WireTime::deserialize(deserializer)? {
        WireTime::Text(at) => Ok(at),
        WireTime::Millis(ms) => DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {ms}"))),
    }
}

impl PriceUpdateData {
    pub fn into_tick(self) -> PriceTick {
        PriceTick {
            symbol: self.symbol,
            price: self.price,
            bid: self.bid,
            ask: self.ask,
            volume: self.volume,
            timestamp: self.last_update,
            source: PriceSource::Stream,
        }
    }
}
