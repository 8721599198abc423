//! Main application orchestration.
//!
//! Builds every service once and passes it down explicitly:
//! - Cache worker (offline HTTP cache) behind a `WorkerHandle`
//! - Query cache and prefetcher reading through the worker
//! - Durable store, sync queue and network monitor
//! - Price stream client, its last-known price table and persistence
//! - Metrics sampling

use crate::bridge::{WorkerQuerySource, WorkerSyncTransport};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use cmdty_core::{Clock, Connectivity, EntityType, Notifier, PriceTick, SystemClock};
use cmdty_persistence::{DurableStore, DurableStoreConfig};
use cmdty_query::{PrefetchConfig, Prefetcher, QueryCache, QueryCacheConfig};
use cmdty_sync::{NetworkEvent, NetworkMonitor, ReqwestProbe, SyncQueue};
use cmdty_telemetry::Metrics;
use cmdty_worker::{CacheWorker, ReqwestNetwork, WorkerHandle};
use cmdty_ws::{ConnectionState, PriceTable, StreamClient, StreamHandle};
use reqwest::Url;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main application.
pub struct Application {
    config: AppConfig,
    notifier: Notifier,
    cancel: CancellationToken,
    store: Arc<DurableStore>,
    worker: WorkerHandle,
    worker_task: Option<JoinHandle<()>>,
    monitor: Arc<NetworkMonitor>,
    query_cache: QueryCache,
    prefetcher: Option<Prefetcher>,
    sync_queue: Arc<SyncQueue>,
    stream: Option<StreamClient>,
    tasks: Vec<JoinHandle<()>>,
}

impl Application {
    /// Build every component. Must run inside a tokio runtime; nothing
    /// touches the network until `start`.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> AppResult<Self> {
        config.validate()?;
        let base = Url::parse(&config.api_base_url)
            .map_err(|e| AppError::Config(format!("Invalid api_base_url: {e}")))?;
        let notifier = Notifier::default();
        let cancel = CancellationToken::new();

        let store_config = DurableStoreConfig::from(&config.durable_store);
        let store = Arc::new(DurableStore::open(store_config, Arc::clone(&clock))?);

        let network = ReqwestNetwork::new(Duration::from_millis(
            config.asset_cache.request_timeout_ms,
        ))
        .map_err(cmdty_worker::CacheError::from)?;
        let (worker, worker_task) = CacheWorker::spawn(
            config.asset_cache.to_worker_config(&config.api_base_url),
            Arc::new(network),
            Arc::clone(&clock),
            cancel.child_token(),
        )?;

        let probe = ReqwestProbe::new(
            config.probe_url(),
            Duration::from_millis(config.network.probe_timeout_ms),
        )?;
        let monitor = Arc::new(NetworkMonitor::new(
            Arc::new(probe),
            notifier.clone(),
            Duration::from_secs(config.network.probe_interval_secs),
        ));

        let query_cache = QueryCache::new(
            QueryCacheConfig::from(&config.query_cache),
            config.profile,
            Arc::new(WorkerQuerySource::new(worker.clone(), base.clone())),
            Arc::clone(&clock),
        );
        let prefetcher = config.prefetch.enabled.then(|| {
            Prefetcher::new(
                query_cache.clone(),
                Arc::clone(&monitor) as Arc<dyn Connectivity>,
                PrefetchConfig::from(&config.prefetch),
            )
        });

        let endpoint = base
            .join(&config.sync.endpoint)
            .map_err(|e| AppError::Config(format!("Invalid sync.endpoint: {e}")))?;
        let sync_queue = Arc::new(SyncQueue::new(
            Arc::clone(&store),
            Arc::new(WorkerSyncTransport::new(worker.clone(), endpoint)),
            Arc::clone(&monitor) as Arc<dyn Connectivity>,
            notifier.clone(),
            Arc::clone(&clock),
            (&config.sync).into(),
        ));

        let prices = Arc::new(PriceTable::new(config.stream.price_buffer));
        let restored = restore_prices(&store, &prices);
        if restored > 0 {
            info!(restored, "Restored last-known prices");
        }
        let stream = StreamClient::spawn(
            config.stream.to_stream_config(config.user_id.clone()),
            prices,
            notifier.clone(),
            clock,
        );

        Ok(Self {
            config,
            notifier,
            cancel,
            store,
            worker,
            worker_task: Some(worker_task),
            monitor,
            query_cache,
            prefetcher,
            sync_queue,
            stream: Some(stream),
            tasks: Vec::new(),
        })
    }

    /// Install the cache worker, start background tasks and subscribe to the
    /// configured symbols.
    pub async fn start(&mut self) -> AppResult<()> {
        info!(api_base_url = %self.config.api_base_url, "Starting application");

        match self.worker.install().await {
            Ok(report) => info!(?report, "Offline cache installed"),
            // Offline start: the previous version's cache stays usable.
            Err(e) => warn!(error = %e, "Offline cache install failed"),
        }
        let activated = self.worker.activate().await?;
        debug!(deleted = ?activated.deleted, "Offline cache activated");

        self.monitor.start();

        let stream = self.stream_handle()?;
        let tasks = vec![
            Arc::clone(&self.store).spawn_expiry_sweep(
                Duration::from_secs(self.config.durable_store.sweep_interval_secs),
                self.cancel.child_token(),
            ),
            self.query_cache.spawn_sweeper(self.cancel.child_token()),
            self.query_cache.spawn_refetcher(
                Arc::clone(&self.monitor) as Arc<dyn Connectivity>,
                self.cancel.child_token(),
            ),
            Arc::clone(&self.sync_queue)
                .spawn_reconnect_drain(self.monitor.subscribe(), self.cancel.child_token()),
            self.spawn_network_forwarder(stream.clone()),
            self.spawn_price_persister()?,
            self.spawn_stream_watcher(stream.clone()),
            self.spawn_metrics_sampler(stream.clone()),
        ];
        self.tasks.extend(tasks);

        if !self.config.stream.entitled {
            stream.set_entitled(false).await?;
        }
        if !self.config.symbols.is_empty() {
            info!(symbols = ?self.config.symbols, "Subscribing to price stream");
            stream.subscribe(self.config.symbols.clone()).await?;
        }

        let outcome = self.sync_queue.drain().await;
        debug!(?outcome, "Startup sync drain");
        Ok(())
    }

    /// Start, then run until Ctrl-C or `shutdown_token` is cancelled.
    pub async fn run(mut self) -> AppResult<()> {
        self.start().await?;

        info!("Entering main loop");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = self.cancel.cancelled() => info!("Shutdown requested"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every task and close the stream with a normal closure.
    pub async fn shutdown(mut self) {
        info!("Shutting down");
        if let Some(stream) = self.stream.take() {
            stream.shutdown().await;
        }
        self.cancel.cancel();
        self.monitor.shutdown().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
        if let Some(task) = self.worker_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Cache worker task failed");
            }
        }
        info!(pending_sync = self.sync_queue.len(), "Shutdown complete");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    pub fn prefetcher(&self) -> Option<&Prefetcher> {
        self.prefetcher.as_ref()
    }

    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.sync_queue
    }

    pub fn stream_handle(&self) -> AppResult<StreamHandle> {
        self.stream
            .as_ref()
            .map(StreamClient::handle)
            .ok_or(AppError::Stream(cmdty_ws::StreamError::Shutdown))
    }

    pub fn prices(&self) -> Option<Arc<PriceTable>> {
        self.stream.as_ref().map(|s| Arc::clone(s.prices()))
    }

    /// Tell the stream client about connectivity changes.
    fn spawn_network_forwarder(&self, stream: StreamHandle) -> JoinHandle<()> {
        let mut events = self.monitor.subscribe();
        let shutdown = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    event = events.recv() => {
                        let online = match event {
                            Ok(NetworkEvent::Online { .. }) => true,
                            Ok(NetworkEvent::Offline) => false,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Network forwarder lagged");
                                continue;
                            }
                            Err(RecvError::Closed) => return,
                        };
                        Metrics::network_online(online);
                        if stream.set_online(online).await.is_err() {
                            debug!("Stream client gone, network forwarder stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Persist every applied tick as the symbol's last-known price.
    fn spawn_price_persister(&self) -> AppResult<JoinHandle<()>> {
        let prices = self.prices().ok_or(AppError::Stream(cmdty_ws::StreamError::Shutdown))?;
        let mut ticks = prices.subscribe();
        let store = Arc::clone(&self.store);
        let shutdown = self.cancel.child_token();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    tick = ticks.recv() => match tick {
                        Ok(tick) => {
                            Metrics::price_tick(&tick.symbol);
                            if let Err(e) = persist_tick(&store, &tick) {
                                warn!(symbol = %tick.symbol, error = %e, "Failed to persist price");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Price persister lagged");
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        }))
    }

    /// Mirror stream status into metrics as it changes.
    fn spawn_stream_watcher(&self, stream: StreamHandle) -> JoinHandle<()> {
        let mut status = stream.watch();
        let shutdown = self.cancel.child_token();
        tokio::spawn(async move {
            let mut previous = *status.borrow();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let current = *status.borrow_and_update();
                        if current.state != previous.state {
                            info!(from = %previous.state, to = %current.state, attempts = current.attempts, "Stream state changed");
                        }
                        if current.state == ConnectionState::Reconnecting && current.attempts > previous.attempts {
                            Metrics::stream_reconnect("connection_lost");
                        }
                        Metrics::stream_state_set(&current.state.to_string());
                        Metrics::stream_reconnect_attempts(current.attempts);
                        previous = current;
                    }
                }
            }
        })
    }

    fn spawn_metrics_sampler(&self, stream: StreamHandle) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.metrics_interval_secs.max(1));
        let query_cache = self.query_cache.clone();
        let worker = self.worker.clone();
        let sync_queue = Arc::clone(&self.sync_queue);
        let monitor = Arc::clone(&self.monitor);
        let prices = self.prices();
        let metrics_file = self.config.metrics_file.clone();
        let shutdown = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let status = stream.status();
                        Metrics::stream_state_set(&status.state.to_string());
                        Metrics::stream_reconnect_attempts(status.attempts);
                        if let Some(prices) = &prices {
                            Metrics::price_symbols(prices.len());
                        }

                        let m = query_cache.metrics();
                        Metrics::query_cache(
                            m.hit_rate,
                            m.total_bytes,
                            [("fresh", m.fresh), ("stale", m.stale), ("pending", m.pending), ("error", m.error)],
                            m.evictions,
                        );

                        match worker.stats().await {
                            Ok(partitions) => {
                                for p in partitions {
                                    Metrics::asset_partition(&p.name, p.items, p.bytes);
                                }
                            }
                            Err(e) => debug!(error = %e, "Cache worker stats unavailable"),
                        }

                        Metrics::sync_queue_depth(sync_queue.len());
                        Metrics::network_online(monitor.is_online());

                        if let Some(path) = &metrics_file {
                            if let Err(e) = write_metrics(path).await {
                                warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Write the registry in text format, swapping the file in atomically.
async fn write_metrics(path: &Path) -> AppResult<()> {
    let text = Metrics::render()?;
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Store a tick under its symbol, indexed by `lastUpdated`.
fn persist_tick(store: &DurableStore, tick: &PriceTick) -> AppResult<()> {
    let mut value = serde_json::to_value(tick)?;
    value["lastUpdated"] = serde_json::Value::String(tick.timestamp.to_rfc3339());
    store.put(EntityType::Commodities, &tick.symbol, value)?;
    Ok(())
}

/// Seed the price table from persisted last-known prices.
fn restore_prices(store: &DurableStore, prices: &PriceTable) -> usize {
    let mut restored = 0;
    for record in store.list(EntityType::Commodities) {
        match serde_json::from_value::<PriceTick>(record.payload) {
            Ok(tick) => {
                prices.apply(tick);
                restored += 1;
            }
            Err(e) => warn!(key = %record.key, error = %e, "Skipping unreadable price record"),
        }
    }
    restored
}
