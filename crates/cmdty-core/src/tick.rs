//! Live price observations.

use crate::Price;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Where a tick came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Real-time price stream.
    Stream,
    /// REST polling fallback.
    Polling,
    /// Market-data bridge.
    Bridge,
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Polling => write!(f, "polling"),
            Self::Bridge => write!(f, "bridge"),
        }
    }
}

/// A single price observation for one commodity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub source: PriceSource,
}

impl PriceTick {
    pub fn new(symbol: impl Into<String>, price: Price, timestamp: DateTime<Utc>, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            bid: None,
            ask: None,
            volume: None,
            timestamp,
            source,
        }
    }

    /// Bid/ask spread, when both sides are quoted.
    pub fn spread(&self) -> Option<Price> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(Price::new(ask.inner() - bid.inner())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_spread() {
        let mut tick = PriceTick::new("Gold Futures", Price::new(dec!(2001.5)), Utc::now(), PriceSource::Stream);
        assert_eq!(tick.spread(), None);

        tick.bid = Some(Price::new(dec!(2001.0)));
        tick.ask = Some(Price::new(dec!(2002.0)));
        assert_eq!(tick.spread(), Some(Price::new(dec!(1.0))));
    }
}
