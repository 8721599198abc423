//! Price stream lifecycle integration tests.
//!
//! Tests the connection lifecycle:
//! - Connection establishment and subscription
//! - Price updates reaching the price table
//! - Reconnection with subscription replay
//! - Application startup, persistence and shutdown

mod integration;
use integration::common::mock_http::MockHttpServer;
use integration::common::mock_ws::MockWsServer;

use cmdty_app::{AppConfig, Application};
use cmdty_core::{EntityType, Notifier, SystemClock};
use cmdty_sync::DrainOutcome;
use cmdty_ws::{ConnectionState, PriceTable, StreamClient, StreamConfig};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn stream_config(url: String) -> StreamConfig {
    StreamConfig {
        url,
        reconnect_base_delay_ms: 50,
        reconnect_max_delay_ms: 200,
        max_reconnect_attempts: 3,
        connect_timeout_ms: 1000,
        ..Default::default()
    }
}

fn spawn_client(url: String) -> StreamClient {
    StreamClient::spawn(
        stream_config(url),
        Arc::new(PriceTable::new(64)),
        Notifier::default(),
        Arc::new(SystemClock),
    )
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(3), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Subscribing connects, sends the subscription and applies price updates.
#[tokio::test]
async fn test_stream_subscribes_and_receives_prices() {
    let server = MockWsServer::start().await;
    let client = spawn_client(server.url());
    let handle = client.handle();
    let mut ticks = client.prices().subscribe();

    handle
        .subscribe(vec!["Gold Futures".to_string(), "Crude Oil".to_string()])
        .await
        .unwrap();

    let status = timeout(
        Duration::from_secs(3),
        handle.wait_for(|s| s.state == ConnectionState::Open),
    )
    .await
    .expect("should open within timeout")
    .unwrap();
    assert_eq!(status.attempts, 0);

    let tick = timeout(Duration::from_secs(3), ticks.recv())
        .await
        .expect("price update within timeout")
        .unwrap();
    assert_eq!(tick.price.inner(), dec!(2001.50));

    assert!(eventually(|| async { client.prices().len() == 2 }).await);
    let gold = client.prices().get("Gold Futures").unwrap();
    assert_eq!(gold.bid.map(|p| p.inner()), Some(dec!(2001.25)));

    let subscribes = server.received_of_type("subscribe").await;
    assert_eq!(subscribes.len(), 1);
    let commodities = subscribes[0]["commodities"].as_array().unwrap();
    assert_eq!(commodities.len(), 2);
    assert!(subscribes[0]["sessionId"].is_string());

    client.shutdown().await;
    assert!(eventually(|| async { server.close_codes().await.contains(&1000) }).await);
    server.shutdown().await;
}

/// An abnormal server close triggers a reconnect that replays subscriptions.
#[tokio::test]
async fn test_stream_reconnects_and_resubscribes() {
    let server = MockWsServer::start().await;
    let client = spawn_client(server.url());
    let handle = client.handle();

    handle.subscribe(vec!["Silver".to_string()]).await.unwrap();
    timeout(
        Duration::from_secs(3),
        handle.wait_for(|s| s.state == ConnectionState::Open),
    )
    .await
    .expect("should open")
    .unwrap();
    assert!(eventually(|| async { server.received_of_type("subscribe").await.len() == 1 }).await);

    server.kick(1011);

    assert!(eventually(|| async { server.connection_count().await >= 2 }).await);
    assert!(eventually(|| async { server.received_of_type("subscribe").await.len() == 2 }).await);
    let status = timeout(
        Duration::from_secs(3),
        handle.wait_for(|s| s.state == ConnectionState::Open),
    )
    .await
    .expect("should reopen")
    .unwrap();
    assert_eq!(status.attempts, 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// A normal server close ends the session without reconnecting.
#[tokio::test]
async fn test_normal_close_does_not_reconnect() {
    let server = MockWsServer::start().await;
    let client = spawn_client(server.url());
    let handle = client.handle();

    handle.connect().await.unwrap();
    timeout(
        Duration::from_secs(3),
        handle.wait_for(|s| s.state == ConnectionState::Open),
    )
    .await
    .expect("should open")
    .unwrap();

    server.kick(1000);
    timeout(
        Duration::from_secs(3),
        handle.wait_for(|s| s.state == ConnectionState::Closed),
    )
    .await
    .expect("should close")
    .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count().await, 1);

    client.shutdown().await;
    server.shutdown().await;
}

fn app_config(http: &MockHttpServer, ws: &MockWsServer, dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig {
        api_base_url: http.url(),
        symbols: vec!["GC".to_string()],
        ..AppConfig::default()
    };
    config.stream.url = ws.url();
    config.stream.reconnect_base_delay_ms = 50;
    config.durable_store.dir = Some(dir.join("store"));
    config.asset_cache.snapshot_dir = Some(dir.join("assets"));
    config
}

/// Full startup: install, subscribe, persist prices, replay a queued mutation.
#[tokio::test]
async fn test_application_end_to_end() {
    let http = MockHttpServer::start().await;
    let ws = MockWsServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut app = Application::new(app_config(&http, &ws, dir.path())).unwrap();
    app.start().await.unwrap();

    let requests = http.requests().await;
    assert!(requests.contains(&"GET /".to_string()));
    assert!(requests.contains(&"GET /manifest.webmanifest".to_string()));

    let prices = app.prices().unwrap();
    assert!(eventually(|| async { prices.get("GC").is_some() }).await);
    assert!(eventually(|| async { app.store().get(EntityType::Commodities, "GC").is_some() }).await);

    app.sync_queue()
        .enqueue("portfolio.add", serde_json::json!({"symbol": "GC", "qty": 1}))
        .unwrap();
    let outcome = app.sync_queue().drain().await;
    assert!(matches!(
        outcome,
        DrainOutcome::Drained(report) if report.sent == 1 && report.remaining == 0
    ));
    assert!(http.requests().await.contains(&"POST /api/sync".to_string()));

    app.shutdown().await;
    assert!(eventually(|| async { ws.close_codes().await.contains(&1000) }).await);

    http.shutdown().await;
    ws.shutdown().await;
}

/// Last-known prices survive a restart.
#[tokio::test]
async fn test_prices_restored_after_restart() {
    let http = MockHttpServer::start().await;
    let ws = MockWsServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut app = Application::new(app_config(&http, &ws, dir.path())).unwrap();
    app.start().await.unwrap();
    assert!(eventually(|| async { app.store().get(EntityType::Commodities, "GC").is_some() }).await);
    app.shutdown().await;

    let restarted = Application::new(app_config(&http, &ws, dir.path())).unwrap();
    let restored = restarted.prices().unwrap().get("GC").unwrap();
    assert_eq!(restored.price.inner(), dec!(2001.50));
    restarted.shutdown().await;

    http.shutdown().await;
    ws.shutdown().await;
}
