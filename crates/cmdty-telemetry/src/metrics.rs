//! Prometheus metrics.
//!
//! Covers:
//! - Stream connection state, reconnects and price ticks
//! - Query cache occupancy and hit rate
//! - Asset cache responses and partition usage
//! - Sync queue depth and replay failures
//! - Network status
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which must crash at startup. These panics only occur
//! during static initialization.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_int_counter,
    register_int_gauge, register_int_gauge_vec, CounterVec, Encoder, Gauge, GaugeVec, IntCounter,
    IntGauge, IntGaugeVec, TextEncoder,
};

const STREAM_STATES: [&str; 6] = [
    "disconnected",
    "connecting",
    "open",
    "reconnecting",
    "closed",
    "error",
];

/// Stream connection state (1 = open).
pub static STREAM_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("cmdty_stream_connected", "Price stream connection state (1=open)").unwrap()
});

/// Labels: state (disconnected/connecting/open/reconnecting/closed/error)
pub static STREAM_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "cmdty_stream_state",
        "Price stream state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Reconnect attempts made by the current stream session.
pub static STREAM_RECONNECT_ATTEMPTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cmdty_stream_reconnect_attempts",
        "Consecutive reconnect attempts of the price stream"
    )
    .unwrap()
});

pub static STREAM_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cmdty_stream_reconnect_total",
        "Total price stream reconnect attempts",
        &["reason"]
    )
    .unwrap()
});

/// Labels: symbol
pub static PRICE_TICKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cmdty_price_ticks_total",
        "Total price ticks applied",
        &["symbol"]
    )
    .unwrap()
});

pub static PRICE_SYMBOLS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cmdty_price_symbols", "Symbols with a last-known price").unwrap()
});

pub static QUERY_CACHE_HIT_RATE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "cmdty_query_cache_hit_rate",
        "Fraction of query cache entries that are not stale"
    )
    .unwrap()
});

pub static QUERY_CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cmdty_query_cache_bytes", "Estimated query cache size in bytes").unwrap()
});

/// Labels: status (fresh/stale/pending/error)
pub static QUERY_CACHE_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "cmdty_query_cache_entries",
        "Query cache entries by status",
        &["status"]
    )
    .unwrap()
});

pub static QUERY_CACHE_EVICTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cmdty_query_cache_evictions",
        "Query cache entries evicted since start"
    )
    .unwrap()
});

/// Labels: strategy, source (cache/network/offline)
pub static ASSET_RESPONSES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cmdty_asset_responses_total",
        "Responses served by the cache worker",
        &["strategy", "source"]
    )
    .unwrap()
});

/// Labels: partition
pub static ASSET_PARTITION_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "cmdty_asset_partition_bytes",
        "Asset cache partition size in bytes",
        &["partition"]
    )
    .unwrap()
});

/// Labels: partition
pub static ASSET_PARTITION_ITEMS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "cmdty_asset_partition_items",
        "Asset cache partition entry count",
        &["partition"]
    )
    .unwrap()
});

pub static SYNC_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cmdty_sync_queue_depth", "Pending offline mutations").unwrap()
});

pub static SYNC_REPLAYED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "cmdty_sync_replayed_total",
        "Offline mutations replayed successfully"
    )
    .unwrap()
});

/// Labels: action_type
pub static SYNC_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cmdty_sync_failures_total",
        "Failed offline mutation replays",
        &["action_type"]
    )
    .unwrap()
});

pub static NETWORK_ONLINE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("cmdty_network_online", "Network reachability (1=online)").unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Only the active state is set to 1.
    pub fn stream_state_set(state: &str) {
        for s in &STREAM_STATES {
            STREAM_STATE.with_label_values(&[s]).set(0.0);
        }
        STREAM_STATE.with_label_values(&[state]).set(1.0);
        STREAM_CONNECTED.set(if state == "open" { 1.0 } else { 0.0 });
    }

    pub fn stream_reconnect_attempts(attempts: u32) {
        STREAM_RECONNECT_ATTEMPTS.set(i64::from(attempts));
    }

    pub fn stream_reconnect(reason: &str) {
        STREAM_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn price_tick(symbol: &str) {
        PRICE_TICKS_TOTAL.with_label_values(&[symbol]).inc();
    }

    pub fn price_symbols(count: usize) {
        PRICE_SYMBOLS.set(count as i64);
    }

    pub fn query_cache(
        hit_rate: f64,
        total_bytes: usize,
        by_status: [(&str, usize); 4],
        evictions: u64,
    ) {
        QUERY_CACHE_HIT_RATE.set(hit_rate);
        QUERY_CACHE_BYTES.set(total_bytes as i64);
        for (status, count) in by_status {
            QUERY_CACHE_ENTRIES
                .with_label_values(&[status])
                .set(count as i64);
        }
        QUERY_CACHE_EVICTIONS.set(evictions as i64);
    }

    pub fn asset_response(strategy: &str, source: &str) {
        ASSET_RESPONSES_TOTAL
            .with_label_values(&[strategy, source])
            .inc();
    }

    pub fn asset_partition(partition: &str, items: usize, bytes: usize) {
        ASSET_PARTITION_ITEMS
            .with_label_values(&[partition])
            .set(items as i64);
        ASSET_PARTITION_BYTES
            .with_label_values(&[partition])
            .set(bytes as i64);
    }

    pub fn sync_queue_depth(depth: usize) {
        SYNC_QUEUE_DEPTH.set(depth as i64);
    }

    pub fn sync_replayed() {
        SYNC_REPLAYED_TOTAL.inc();
    }

    pub fn sync_failed(action_type: &str) {
        SYNC_FAILURES_TOTAL.with_label_values(&[action_type]).inc();
    }

    pub fn network_online(online: bool) {
        NETWORK_ONLINE.set(if online { 1.0 } else { 0.0 });
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_is_exclusive() {
        Metrics::stream_state_set("reconnecting");
        Metrics::stream_state_set("open");
        assert_eq!(STREAM_STATE.with_label_values(&["open"]).get(), 1.0);
        assert_eq!(STREAM_STATE.with_label_values(&["reconnecting"]).get(), 0.0);
        assert_eq!(STREAM_CONNECTED.get(), 1.0);
    }

    #[test]
    fn test_render_contains_metrics() {
        Metrics::network_online(true);
        Metrics::sync_queue_depth(3);
        let text = Metrics::render().unwrap();
        assert!(text.contains("cmdty_network_online 1"));
        assert!(text.contains("cmdty_sync_queue_depth 3"));
    }
}
