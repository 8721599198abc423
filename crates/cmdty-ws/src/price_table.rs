//! Last-known price per symbol.

use cmdty_core::PriceTick;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Concurrent last-known price table. Every applied tick overwrites the
/// previous one for its symbol and is re-broadcast to subscribers.
pub struct PriceTable {
    prices: DashMap<String, PriceTick>,
    updates: broadcast::Sender<PriceTick>,
}

impl PriceTable {
    pub fn new(capacity: usize) -> Self {
        let (updates, _rx) = broadcast::channel(capacity);
        Self {
            prices: DashMap::new(),
            updates,
        }
    }

    /// Merge a tick, last write wins.
    pub fn apply(&self, tick: PriceTick) {
        trace!(symbol = %tick.symbol, price = %tick.price, source = %tick.source, "Price tick");
        self.prices.insert(tick.symbol.clone(), tick.clone());
        let _ = self.updates.send(tick);
    }

    pub fn get(&self, symbol: &str) -> Option<PriceTick> {
        self.prices.get(symbol).map(|entry| entry.value().clone())
    }

    /// All prices, sorted by symbol.
    pub fn snapshot(&self) -> Vec<PriceTick> {
        let mut ticks: Vec<PriceTick> = self.prices.iter().map(|e| e.value().clone()).collect();
        ticks.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        ticks
    }

    /// Receive every tick applied from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new(1024)
    }
}
